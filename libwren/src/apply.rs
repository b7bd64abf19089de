//! Final pass: patches every relocation site in every input section and
//! writes the dynamic-relocation records reserved by the planner. Sections
//! are processed in parallel; all offsets are frozen by now, so each section
//! only reads shared state and produces its own bytes and records. The GOT
//! image and PLT records are produced serially afterwards.

use crate::LinkState;
use crate::bail;
use crate::elf;
use crate::elf::Rela;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::InputRelocation;
use crate::input::InputSection;
use crate::input::SectionRef;
use crate::layout;
use crate::layout::BranchTarget;
use crate::layout::SymbolValue;
use crate::plan;
use crate::plan::PltScheme;
use crate::scan::is_function_ref;
use crate::symbol_db::PltKey;
use crate::symbol_db::SymbolRef;
use crate::value_flags::ValueFlags;
use itertools::Itertools;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::OverflowPolicy;
use linker_utils::elf::RelocationKind;
use linker_utils::elf::RelocationKindInfo;
use linker_utils::elf::RelocationSpecial;
use linker_utils::ppc32::DTP_OFFSET;
use linker_utils::ppc32::TP_OFFSET;
use linker_utils::ppc32::TlsMask;
use linker_utils::ppc32::ha;
use linker_utils::ppc32::insn;
use linker_utils::ppc32::lo;
use linker_utils::ppc32::read_insn;
use linker_utils::ppc32::relocation_type_from_raw;
use linker_utils::ppc32::write_insn;
use linker_utils::relaxation::RelocationModifier;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;

/// Thread-pointer-relative base left in r3 by a local-dynamic sequence that
/// was downgraded to local-exec. DTV-relative offsets applied on top of it
/// then land on the right address.
const LD_TO_LE_BASE: u32 = DTP_OFFSET.wrapping_sub(TP_OFFSET);

pub(crate) struct ApplyOutput {
    /// Patched image of every section that has content, including the
    /// relaxation growth at the tail. Indexed like the inputs.
    pub(crate) sections: Vec<(SectionRef, Vec<u8>)>,
    pub(crate) rela_dyn: Vec<Rela>,
    pub(crate) rela_plt: Vec<Rela>,
    pub(crate) got: Vec<u8>,
    pub(crate) has_text_relocs: bool,
}

struct SectionResult {
    bytes: Vec<u8>,
    relas: Vec<Rela>,
    warnings: Vec<String>,
    text_reloc: bool,
}

/// Carried between adjacent relocations of a rewritten TLS sequence: what to
/// do with the `__tls_get_addr` call that follows the GOT access.
#[derive(Clone, Copy, Debug)]
enum PendingCallRewrite {
    /// `bl` becomes `addi rt,rt,lo(value)`.
    AddImmediate { rt: u32, value: u32 },
    /// `bl` becomes `add 3,3,2`.
    AddThreadPointer,
    /// The access pair already computed the value; the call becomes a nop.
    Nop,
}

#[tracing::instrument(skip_all, name = "Apply relocations")]
pub(crate) fn apply_relocations(
    state: &mut LinkState,
    inputs: &[InputObject],
) -> Result<ApplyOutput> {
    assign_dynamic_symbol_indices(state);

    let section_refs = inputs
        .iter()
        .enumerate()
        .flat_map(|(file, obj)| {
            (0..obj.sections.len()).map(move |section| SectionRef::new(file, section))
        })
        .filter(|r| {
            let sec = &inputs[r.file as usize].sections[r.section as usize];
            !sec.is_bss && !sec.data.is_empty()
        })
        .collect_vec();

    let results: Vec<(SectionRef, Result<SectionResult>)> = section_refs
        .into_par_iter()
        .map(|section_ref| (section_ref, apply_section(state, inputs, section_ref)))
        .collect();

    let mut output = ApplyOutput {
        sections: Vec::with_capacity(results.len()),
        rela_dyn: Vec::new(),
        rela_plt: Vec::new(),
        got: Vec::new(),
        has_text_relocs: false,
    };
    for (section_ref, result) in results {
        let result = result?;
        output.rela_dyn.extend(result.relas);
        output.has_text_relocs |= result.text_reloc;
        for warning in result.warnings {
            crate::error::warning(&warning);
            state.warnings.push(warning);
        }
        output.sections.push((section_ref, result.bytes));
    }

    build_got_image(state, inputs, &mut output)?;
    emit_copy_relocations(state, &mut output);
    emit_plt_relocations(state, inputs, &mut output)?;

    state.stats.dynamic_relocations_written =
        (output.rela_dyn.len() + output.rela_plt.len()) as u32;
    Ok(output)
}

fn apply_section(
    state: &LinkState,
    inputs: &[InputObject],
    section_ref: SectionRef,
) -> Result<SectionResult> {
    let object = &inputs[section_ref.file as usize];
    let section = &object.sections[section_ref.section as usize];
    let placement = &state.layout.placements[section_ref.file as usize][section_ref.section as usize];

    let mut out = SectionResult {
        bytes: Vec::with_capacity((section.mem_size + placement.extra) as usize),
        relas: Vec::new(),
        warnings: Vec::new(),
        text_reloc: false,
    };
    out.bytes.extend_from_slice(&section.data);
    out.bytes.resize((section.mem_size + placement.extra) as usize, 0);

    crate::relax::write_section_growth(state, inputs, section_ref, &mut out.bytes)?;

    let mut relocations = section.relocations.clone();
    relocations.sort_by_key(|rel| rel.offset);

    let mut modifier = RelocationModifier::Normal;
    let mut pending: Option<(u32, PendingCallRewrite)> = None;
    for (index, rel) in relocations.iter().enumerate() {
        if modifier.skips_next() {
            modifier = RelocationModifier::Normal;
            continue;
        }
        modifier = apply_one(
            state,
            inputs,
            section_ref,
            section,
            rel,
            relocations.get(index + 1),
            &mut pending,
            &mut out,
        )?;
    }
    Ok(out)
}

fn owner_of(
    state: &LinkState,
    object: &InputObject,
    section_ref: SectionRef,
    rel: &InputRelocation,
) -> SymbolRef {
    state
        .db
        .resolve_ref(section_ref.file as usize, rel.symbol, object.num_local_symbols)
}

fn tls_mask_of(state: &LinkState, owner: SymbolRef) -> Result<TlsMask> {
    Ok(match owner {
        SymbolRef::Global(id) => state.db.symbol(state.db.resolved(id)?).ext.tls_mask,
        SymbolRef::Local { file, sym } => state.db.local_ext(file, sym).tls_mask,
    })
}

fn got_offsets_of(state: &LinkState, owner: SymbolRef) -> Result<crate::symbol_db::GotOffsets> {
    Ok(match owner {
        SymbolRef::Global(id) => state.db.symbol(state.db.resolved(id)?).ext.got_offsets,
        SymbolRef::Local { file, sym } => state.db.local_ext(file, sym).got_offsets,
    })
}

fn flags_of(state: &LinkState, owner: SymbolRef) -> Result<ValueFlags> {
    Ok(match owner {
        SymbolRef::Global(id) => state.db.symbol(state.db.resolved(id)?).ext.flags,
        SymbolRef::Local { .. } => ValueFlags::empty(),
    })
}

/// Address a branch or PLT-addressing relocation should land on when the
/// symbol has a live PLT entry: the call stub for the secure scheme, the
/// directly executed slot for the legacy scheme.
fn plt_target_address(state: &LinkState, owner: SymbolRef, key: PltKey) -> Result<Option<u32>> {
    let chain = match owner {
        SymbolRef::Global(id) => &state.db.symbol(state.db.resolved(id)?).ext.plt,
        SymbolRef::Local { file, sym } => &state.db.local_ext(file, sym).plt,
    };
    let mut fallback = None;
    for &plt_id in chain {
        let entry = state.plt.entry(plt_id);
        let Some(slot_offset) = entry.offset() else {
            continue;
        };
        let address = match state.plt_scheme {
            Some(PltScheme::Secure) => entry
                .stub_offset
                .map(|s| state.layout.glink_address + s)
                .unwrap_or(state.layout.plt_address + slot_offset),
            _ => state.layout.plt_address + slot_offset,
        };
        if entry.key == key {
            return Ok(Some(address));
        }
        fallback = Some(address);
    }
    Ok(fallback)
}

/// The TLS-block-relative offset of a symbol, before any tp/dtv bias.
/// `None` when the symbol doesn't live in a TLS section.
fn tls_offset(
    state: &LinkState,
    inputs: &[InputObject],
    owner: SymbolRef,
) -> Result<Option<u32>> {
    let Some(section) = layout::symbol_section(&state.db, inputs, owner)? else {
        return Ok(None);
    };
    if !inputs[section.file as usize].sections[section.section as usize].is_tls() {
        return Ok(None);
    }
    let value = layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;
    let (SymbolValue::Address(address), Some(tls_start)) = (value, state.layout.tls_start) else {
        return Ok(None);
    };
    Ok(Some(address.wrapping_sub(tls_start)))
}

/// Mirror of the scanner's reservation decisions for section relocations.
/// Both sides must agree exactly or the reserved/written totals diverge.
#[allow(clippy::too_many_arguments)]
fn section_dyn_reloc_decision(
    state: &LinkState,
    inputs: &[InputObject],
    owner: SymbolRef,
    ref_kind: crate::input::SymbolKind,
    info: &RelocationKindInfo,
    section: &InputSection,
    interposable: bool,
    flags: ValueFlags,
) -> Result<Option<DynamicRelocationKind>> {
    if !section.is_alloc() || info.byte_size != 4 {
        return Ok(None);
    }
    if flags.needs_copy_relocation() || flags.contains(ValueFlags::GOT_INDIRECT_REWRITE) {
        return Ok(None);
    }
    let output = state.args.output_kind;
    match info.kind {
        RelocationKind::Absolute => {
            if output.is_relocatable() {
                Ok(Some(if interposable {
                    DynamicRelocationKind::Symbolic
                } else {
                    DynamicRelocationKind::Relative
                }))
            } else if interposable
                && output.needs_dynamic()
                && !is_function_ref(&state.db, inputs, owner, ref_kind)?
            {
                Ok(Some(DynamicRelocationKind::Symbolic))
            } else {
                Ok(None)
            }
        }
        RelocationKind::Relative => {
            if interposable && !output.is_relocatable() && output.needs_dynamic() {
                Ok(Some(DynamicRelocationKind::Symbolic))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_one(
    state: &LinkState,
    inputs: &[InputObject],
    section_ref: SectionRef,
    section: &InputSection,
    rel: &InputRelocation,
    next_rel: Option<&InputRelocation>,
    pending: &mut Option<(u32, PendingCallRewrite)>,
    out: &mut SectionResult,
) -> Result<RelocationModifier> {
    let object = &inputs[section_ref.file as usize];
    let Some(info) = relocation_type_from_raw(rel.r_type) else {
        bail!(
            "{}({}+0x{:x}): unsupported relocation type {}",
            object.name,
            section.name,
            rel.offset,
            linker_utils::ppc32::rel_type_to_string(rel.r_type),
        );
    };

    let placement =
        &state.layout.placements[section_ref.file as usize][section_ref.section as usize];
    let owner = owner_of(state, object, section_ref, rel);
    let resolved_value =
        layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;
    let place = placement.address + rel.offset;
    let flags = flags_of(state, owner)?;
    let interposable = match owner {
        SymbolRef::Global(id) => state.db.is_interposable(id, &state.args)?,
        SymbolRef::Local { .. } => false,
    };

    // A pending call rewrite consumes the branch relocation of its sequence.
    if let Some((call_offset, rewrite)) = *pending {
        if call_offset == rel.offset
            && matches!(
                info.kind,
                RelocationKind::BranchRelative
                    | RelocationKind::PltBranch
                    | RelocationKind::TlsGdMark
                    | RelocationKind::TlsLdMark
            )
        {
            *pending = None;
            let word = match rewrite {
                PendingCallRewrite::AddImmediate { rt, value } => insn::addi(rt, rt, lo(value)),
                PendingCallRewrite::AddThreadPointer => insn::add(3, 3, 2),
                PendingCallRewrite::Nop => insn::NOP,
            };
            write_word(placement, &mut out.bytes, rel.offset, word);
            // A marker relocation is paired with the branch relocation at
            // the same offset; skip it so it doesn't repatch the rewrite.
            let marker_pair = matches!(
                info.kind,
                RelocationKind::TlsGdMark | RelocationKind::TlsLdMark
            ) && next_rel.is_some_and(|n| n.offset == rel.offset);
            return Ok(if marker_pair {
                RelocationModifier::SkipNextRelocation
            } else {
                RelocationModifier::Normal
            });
        }
        // The expected call never materialized; the verification pass should
        // have caught this.
        bail!(
            "{}({}+0x{:x}): rewritten TLS sequence has no resolver call",
            object.name,
            section.name,
            call_offset,
        );
    }

    let value: i64 = match info.kind {
        RelocationKind::None
        | RelocationKind::TlsMark
        | RelocationKind::TlsGdMark
        | RelocationKind::TlsLdMark => return Ok(RelocationModifier::Normal),

        RelocationKind::Absolute | RelocationKind::Branch => {
            let ref_kind = object.symbols[rel.symbol as usize].kind;
            if let Some(kind) = section_dyn_reloc_decision(
                state, inputs, owner, ref_kind, &info, section, interposable, flags,
            )? {
                let (r_sym, addend, slot_value) = match kind {
                    DynamicRelocationKind::Relative => {
                        let v = resolved_value.value().wrapping_add(rel.addend as u32);
                        (0, v as i32, v)
                    }
                    _ => (dynsym_index(state, owner)?, rel.addend, 0),
                };
                // If the word was moved by the erratum workaround, the
                // loader must patch the relocated copy.
                let record_place =
                    placement.address + write_offset(placement, rel.offset) as u32;
                out.relas
                    .push(elf::new_rela(record_place, kind.ppc32_r_type(), r_sym, addend));
                if !section.is_writable() {
                    out.text_reloc = true;
                }
                i64::from(slot_value)
            } else if flags.contains(ValueFlags::GOT_INDIRECT_REWRITE) {
                return rewrite_high_low_to_got_load(state, placement, rel, &info, owner, out);
            } else if flags.needs_copy_relocation() {
                let copy = copy_address(state, owner)?;
                i64::from(copy.wrapping_add(rel.addend as u32))
            } else if interposable && flags.needs_plt() {
                let target = plt_target_address(
                    state,
                    owner,
                    PltKey {
                        got2: None,
                        addend: 0,
                    },
                )?;
                match target {
                    Some(t) => i64::from(t),
                    None => i64::from(resolved_value.value().wrapping_add(rel.addend as u32)),
                }
            } else {
                if resolved_value.is_undefined() && info.kind == RelocationKind::Branch {
                    // Branch to an undefined weak target: fall through to the
                    // next instruction instead of address zero.
                    i64::from(place.wrapping_add(4))
                } else {
                    i64::from(resolved_value.value().wrapping_add(rel.addend as u32))
                }
            }
        }

        RelocationKind::Relative => {
            let ref_kind = object.symbols[rel.symbol as usize].kind;
            if let Some(kind) = section_dyn_reloc_decision(
                state, inputs, owner, ref_kind, &info, section, interposable, flags,
            )? {
                // The executable's addresses are fixed, so the pc bias can be
                // folded into the addend of an ordinary symbolic record.
                out.relas.push(elf::new_rela(
                    place,
                    kind.ppc32_r_type(),
                    dynsym_index(state, owner)?,
                    rel.addend.wrapping_sub(place as i32),
                ));
                if !section.is_writable() {
                    out.text_reloc = true;
                }
                0
            } else {
                i64::from(resolved_value.value().wrapping_add(rel.addend as u32))
                    - i64::from(place)
            }
        }

        RelocationKind::BranchRelative => {
            let key = PltKey {
                got2: None,
                addend: 0,
            };
            if let Some(stub) = plt_target_address(state, owner, key)? {
                i64::from(stub) - i64::from(place)
            } else if resolved_value.is_undefined() {
                // Never-taken call through a weak symbol: branch over it.
                4
            } else {
                let target = resolved_value.value().wrapping_add(rel.addend as u32);
                let mut distance = i64::from(target) - i64::from(place);
                let fits = match info.bit_width {
                    26 => linker_utils::ppc32::distance_fits_branch24(distance),
                    _ => linker_utils::ppc32::distance_fits_branch14(distance),
                };
                if !fits {
                    let branch_target = BranchTarget {
                        symbol: owner,
                        addend: rel.addend,
                    };
                    if let Some(trampoline) = placement.trampoline_for(branch_target) {
                        distance = i64::from(placement.address + trampoline.offset)
                            - i64::from(place);
                    }
                }
                distance
            }
        }

        RelocationKind::PltBranch | RelocationKind::PltAddr => {
            let key = if rel.addend != 0 {
                PltKey {
                    got2: object
                        .section_index_by_name(".got2")
                        .map(|s| SectionRef::new(section_ref.file as usize, s)),
                    addend: rel.addend as u32,
                }
            } else {
                PltKey {
                    got2: None,
                    addend: 0,
                }
            };
            let target = match plt_target_address(state, owner, key)? {
                Some(t) => t,
                // Trimmed: the call binds directly. The addend selected the
                // caller's GOT pointer, it does not offset the target.
                None => resolved_value.value(),
            };
            if info.pc_relative {
                i64::from(target) - i64::from(place)
            } else {
                i64::from(target)
            }
        }

        RelocationKind::Got => {
            let offsets = got_offsets_of(state, owner)?;
            let Some(slot) = offsets.addr else {
                bail!(
                    "{}({}+0x{:x}): GOT relocation against `{}` but no slot was allocated",
                    object.name,
                    section.name,
                    rel.offset,
                    object.symbols[rel.symbol as usize].name,
                );
            };
            i64::from(slot) + i64::from(rel.addend) - i64::from(state.got.base_offset())
        }

        RelocationKind::GotTlsGd => {
            return apply_got_tls_gd(
                state, inputs, placement, rel, &info, owner, false, pending, out,
            );
        }
        RelocationKind::GotTlsLd => {
            return apply_got_tls_gd(
                state, inputs, placement, rel, &info, owner, true, pending, out,
            );
        }

        RelocationKind::GotTpRel => {
            let offsets = got_offsets_of(state, owner)?;
            let slot = offsets.tprel.map(i64::from).unwrap_or_default();
            slot + i64::from(rel.addend) - i64::from(state.got.base_offset())
        }

        RelocationKind::GotDtpRel => {
            let offsets = got_offsets_of(state, owner)?;
            let slot = offsets.dtprel.map(i64::from).unwrap_or_default();
            slot + i64::from(rel.addend) - i64::from(state.got.base_offset())
        }

        RelocationKind::TpRel => {
            let Some(offset) = tls_offset(state, inputs, owner)? else {
                bail!(
                    "{}({}+0x{:x}): thread-local relocation against non-TLS symbol",
                    object.name,
                    section.name,
                    rel.offset,
                );
            };
            i64::from(offset.wrapping_add(rel.addend as u32).wrapping_sub(TP_OFFSET) as i32)
        }

        RelocationKind::DtpRel => {
            let Some(offset) = tls_offset(state, inputs, owner)? else {
                bail!(
                    "{}({}+0x{:x}): thread-local relocation against non-TLS symbol",
                    object.name,
                    section.name,
                    rel.offset,
                );
            };
            i64::from(offset.wrapping_add(rel.addend as u32).wrapping_sub(DTP_OFFSET) as i32)
        }

        RelocationKind::SdaRelative | RelocationKind::SdaBased21 => {
            let Some(sda_base) = state.layout.sda_base else {
                bail!(
                    "{}({}+0x{:x}): small-data relocation but the output has no small-data \
                     area",
                    object.name,
                    section.name,
                    rel.offset,
                );
            };
            let target_section = layout::symbol_section(&state.db, inputs, owner)?;
            let in_small_data = target_section.is_some_and(|s| {
                let name = &inputs[s.file as usize].sections[s.section as usize].name;
                name == ".sdata" || name == ".sbss"
            });
            if !in_small_data {
                bail!(
                    "{}({}+0x{:x}): small-data relocation against `{}` which is not in \
                     .sdata/.sbss",
                    object.name,
                    section.name,
                    rel.offset,
                    object.symbols[rel.symbol as usize].name,
                );
            }
            let offset = resolved_value
                .value()
                .wrapping_add(rel.addend as u32)
                .wrapping_sub(sda_base);
            if info.kind == RelocationKind::SdaBased21 {
                // The base register field is patched to r13 along with the
                // offset.
                return apply_sda21(placement, rel, &info, offset, out);
            }
            i64::from(offset as i32)
        }

        RelocationKind::SectionOffset => {
            let Some(target_section) = layout::symbol_section(&state.db, inputs, owner)? else {
                bail!(
                    "{}({}+0x{:x}): section-offset relocation against a symbol with no \
                     section",
                    object.name,
                    section.name,
                    rel.offset,
                );
            };
            let section_address = state.layout.placements[target_section.file as usize]
                [target_section.section as usize]
                .address;
            i64::from(resolved_value.value().wrapping_add(rel.addend as u32))
                - i64::from(section_address)
        }

        RelocationKind::DtpMod
        | RelocationKind::Copy
        | RelocationKind::GlobDat
        | RelocationKind::JumpSlot
        | RelocationKind::Irelative => bail!(
            "{}({}+0x{:x}): relocation {} is only valid in linker-generated sections",
            object.name,
            section.name,
            rel.offset,
            info.name,
        ),
    };

    write_field(
        state,
        placement,
        section,
        object,
        rel,
        &info,
        value,
        resolved_value.is_undefined(),
        out,
    )?;
    Ok(RelocationModifier::Normal)
}

/// General/local-dynamic GOT access, possibly downgraded by the optimizer.
#[allow(clippy::too_many_arguments)]
fn apply_got_tls_gd(
    state: &LinkState,
    inputs: &[InputObject],
    placement: &crate::layout::SectionPlacement,
    rel: &InputRelocation,
    info: &RelocationKindInfo,
    owner: SymbolRef,
    local_dynamic: bool,
    pending: &mut Option<(u32, PendingCallRewrite)>,
    out: &mut SectionResult,
) -> Result<RelocationModifier> {
    let mask = tls_mask_of(state, owner)?;
    let rewrite = if local_dynamic {
        if mask.contains(TlsMask::LD) {
            crate::tls_opt::GdRewrite::None
        } else {
            crate::tls_opt::GdRewrite::ToLocalExec
        }
    } else {
        crate::tls_opt::gd_rewrite_for_mask(mask)
    };
    let still_dynamic = rewrite == crate::tls_opt::GdRewrite::None;
    let base_form = matches!(
        rel.r_type,
        object::elf::R_PPC_GOT_TLSGD16 | object::elf::R_PPC_GOT_TLSLD16
    );
    let lo_form = matches!(
        rel.r_type,
        object::elf::R_PPC_GOT_TLSGD16_LO | object::elf::R_PPC_GOT_TLSLD16_LO
    );

    if still_dynamic {
        let slot = if local_dynamic {
            state.tlsld.offset
        } else {
            got_offsets_of(state, owner)?.tlsgd
        };
        let Some(slot) = slot else {
            bail!("Internal error: dynamic TLS access without an allocated GOT pair");
        };
        let value =
            i64::from(slot) + i64::from(rel.addend) - i64::from(state.got.base_offset());
        let field_value = if info.special == RelocationSpecial::HighAdjust {
            value.wrapping_add(0x8000)
        } else {
            value
        };
        let offset = write_offset(placement, rel.offset);
        write_halfword_or_word(&mut out.bytes, offset, info, field_value);
        return Ok(RelocationModifier::Normal);
    }

    // Downgraded. Rewrite the instruction and queue the call-site rewrite.
    let to_initial_exec = rewrite == crate::tls_opt::GdRewrite::ToInitialExec;
    let insn_offset = write_offset(placement, rel.offset & !3);
    let old_word = read_insn(&out.bytes, insn_offset);
    let rt = (old_word >> 21) & 0x1f;
    let ra = (old_word >> 16) & 0x1f;

    let target_value: u32 = if local_dynamic {
        LD_TO_LE_BASE
    } else if to_initial_exec {
        let slot = got_offsets_of(state, owner)?
            .tprel
            .map(i64::from)
            .unwrap_or_default();
        (slot - i64::from(state.got.base_offset())) as u32
    } else {
        let Some(offset) = tls_offset(state, inputs, owner)? else {
            bail!("Internal error: local-exec rewrite of a non-TLS symbol");
        };
        offset.wrapping_sub(TP_OFFSET)
    };

    // Field values are chosen so that the descriptor's own shift and
    // high-adjust handling produce the right bits: high-half forms get the
    // full biased value, low/base forms get the finished halfword.
    let high_bias: u32 = if info.special == RelocationSpecial::HighAdjust {
        0x8000
    } else {
        0
    };
    let (new_word, field_value) = if to_initial_exec {
        // `addi/addis rt,.. -> lwz rt, slot(..)`, keeping the GOT register.
        if base_form || lo_form {
            (insn::lwz(rt, ra, 0), i64::from(target_value as i32))
        } else {
            (old_word, i64::from(target_value.wrapping_add(high_bias)))
        }
    } else if base_form {
        // Small model: the single instruction becomes the high half of an
        // immediate pair; the call supplies the low half.
        (insn::addis(rt, 2, 0), i64::from(ha(target_value)))
    } else if lo_form {
        (old_word, i64::from(lo(target_value)))
    } else {
        // High-half form: the descriptor's shift extracts the top bits.
        (
            insn::addis(rt, 2, 0),
            i64::from(target_value.wrapping_add(high_bias)),
        )
    };

    write_insn(&mut out.bytes, insn_offset, new_word);
    let field_offset = write_offset(placement, rel.offset);
    write_halfword_or_word(&mut out.bytes, field_offset, info, field_value);

    if base_form || lo_form {
        let rewrite = if to_initial_exec {
            PendingCallRewrite::AddThreadPointer
        } else if base_form {
            PendingCallRewrite::AddImmediate {
                rt,
                value: target_value,
            }
        } else {
            // The pair already produced the full value.
            PendingCallRewrite::Nop
        };
        *pending = Some((rel.offset + 2, rewrite));
    }
    Ok(RelocationModifier::Normal)
}

/// Protected-visibility direct address formation rewritten into a GOT load:
/// the high half keeps its `lis`/`addis` but now forms the slot address, and
/// the low-half `addi` becomes `lwz` from that slot.
fn rewrite_high_low_to_got_load(
    state: &LinkState,
    placement: &crate::layout::SectionPlacement,
    rel: &InputRelocation,
    info: &RelocationKindInfo,
    owner: SymbolRef,
    out: &mut SectionResult,
) -> Result<RelocationModifier> {
    let offsets = got_offsets_of(state, owner)?;
    let Some(slot) = offsets.addr else {
        bail!("Internal error: GOT rewrite without an allocated slot");
    };
    let slot_address = state.layout.got_address + slot;

    match rel.r_type {
        object::elf::R_PPC_ADDR16_HA | object::elf::R_PPC_ADDR16_HI => {
            let offset = write_offset(placement, rel.offset);
            write_halfword_or_word(&mut out.bytes, offset, info, i64::from(ha(slot_address)));
        }
        object::elf::R_PPC_ADDR16_LO => {
            let insn_offset = write_offset(placement, rel.offset & !3);
            let old_word = read_insn(&out.bytes, insn_offset);
            let rt = (old_word >> 21) & 0x1f;
            let ra = (old_word >> 16) & 0x1f;
            write_insn(
                &mut out.bytes,
                insn_offset,
                insn::lwz(rt, ra, lo(slot_address)),
            );
        }
        _ => {
            // Other direct forms against this symbol keep the plain address;
            // the slot exists precisely so the pair above stays coherent.
            let offset = write_offset(placement, rel.offset);
            write_halfword_or_word(&mut out.bytes, offset, info, i64::from(slot_address));
        }
    }
    Ok(RelocationModifier::Normal)
}

/// Small-data access with a patched base register: r13 is the small-data
/// base in the ABI.
fn apply_sda21(
    placement: &crate::layout::SectionPlacement,
    rel: &InputRelocation,
    info: &RelocationKindInfo,
    offset_value: u32,
    out: &mut SectionResult,
) -> Result<RelocationModifier> {
    if let Err(overflow) = info.check_value(i64::from(offset_value as i32)) {
        bail!("Small-data offset overflow: {overflow}");
    }
    let insn_offset = write_offset(placement, rel.offset & !3);
    let old_word = read_insn(&out.bytes, insn_offset);
    let combined = (13 << 16) | (offset_value & 0xffff);
    write_insn(
        &mut out.bytes,
        insn_offset,
        info.insert(old_word, i64::from(combined)),
    );
    Ok(RelocationModifier::Normal)
}

/// Final field write with overflow checking. The overflow policy for 16-bit
/// immediates depends on the instruction that holds the field, so the
/// enclosing opcode is inspected here rather than trusting the descriptor
/// alone.
#[allow(clippy::too_many_arguments)]
fn write_field(
    state: &LinkState,
    placement: &crate::layout::SectionPlacement,
    section: &InputSection,
    object: &InputObject,
    rel: &InputRelocation,
    info: &RelocationKindInfo,
    mut value: i64,
    target_undefined: bool,
    out: &mut SectionResult,
) -> Result {
    if info.byte_size == 0 {
        return Ok(());
    }
    if info.special == RelocationSpecial::HighAdjust {
        value = value.wrapping_add(0x8000);
    }

    // Branch-prediction hint forms encode the static prediction in the
    // y-bit, which must account for the displacement's direction.
    let hint = match rel.r_type {
        object::elf::R_PPC_ADDR14_BRTAKEN | object::elf::R_PPC_REL14_BRTAKEN => Some(true),
        object::elf::R_PPC_ADDR14_BRNTAKEN | object::elf::R_PPC_REL14_BRNTAKEN => Some(false),
        _ => None,
    };
    if let Some(taken) = hint {
        let word_offset = write_offset(placement, rel.offset & !3);
        let mut word = read_insn(&out.bytes, word_offset);
        let mut y_bit = taken;
        if value < 0 {
            y_bit = !y_bit;
        }
        if y_bit {
            word |= 0x0020_0000;
        } else {
            word &= !0x0020_0000;
        }
        write_insn(&mut out.bytes, word_offset, word);
    }

    let mut policy = info.overflow;
    if info.byte_size == 2
        && section.is_executable()
        && rel.offset % 4 == 2
        && policy != OverflowPolicy::Ignore
    {
        let word_offset = write_offset(placement, rel.offset & !3);
        policy = linker_utils::ppc32::immediate_field_policy(read_insn(&out.bytes, word_offset));
    }
    let check_info = RelocationKindInfo {
        overflow: policy,
        ..*info
    };
    if let Err(overflow) = check_info.check_value(value) {
        // A branch to an undefined or weak-undefined symbol is the
        // never-taken-call idiom; complaining about its displacement would
        // only generate noise.
        let suppress = info.kind.is_branch() && target_undefined;
        if !suppress {
            out.warnings.push(format!(
                "{}({}+0x{:x}): relocation {} against `{}` overflows: {overflow}",
                object.name,
                section.name,
                rel.offset,
                info.name,
                object.symbols[rel.symbol as usize].name,
            ));
        }
    }

    let offset = write_offset(placement, rel.offset);
    write_halfword_or_word(&mut out.bytes, offset, info, value);
    Ok(())
}

/// Replaces the whole instruction word containing `offset`.
fn write_word(
    placement: &crate::layout::SectionPlacement,
    bytes: &mut [u8],
    offset: u32,
    word: u32,
) {
    let at = write_offset(placement, offset & !3);
    write_insn(bytes, at, word);
}

/// Redirects a write into the erratum patch area when the containing word
/// was moved out of a page-boundary slot.
fn write_offset(placement: &crate::layout::SectionPlacement, offset: u32) -> usize {
    let word_start = offset & !3;
    match placement.moved_to(word_start) {
        Some(patch) => (patch + (offset - word_start)) as usize,
        None => offset as usize,
    }
}

fn write_halfword_or_word(bytes: &mut [u8], offset: usize, info: &RelocationKindInfo, value: i64) {
    match info.byte_size {
        2 => {
            let old = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap());
            let new = info.insert(u32::from(old), value) as u16;
            bytes[offset..offset + 2].copy_from_slice(&new.to_be_bytes());
        }
        _ => {
            let old = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let new = info.insert(old, value);
            bytes[offset..offset + 4].copy_from_slice(&new.to_be_bytes());
        }
    }
}

fn copy_address(state: &LinkState, owner: SymbolRef) -> Result<u32> {
    let SymbolRef::Global(id) = owner else {
        bail!("Internal error: copy relocation against a local symbol");
    };
    let id = state.db.resolved(id)?;
    let Some(offset) = state.db.symbol(id).ext.copy_offset else {
        bail!("Internal error: copy relocation without an assigned shadow");
    };
    Ok(state.layout.dynbss_address + offset)
}

fn dynsym_index(state: &LinkState, owner: SymbolRef) -> Result<u32> {
    let SymbolRef::Global(id) = owner else {
        bail!("Internal error: dynamic relocation against a local symbol");
    };
    let id = state.db.resolved(id)?;
    match state.db.symbol(id).ext.dynamic_symbol_index {
        Some(index) => Ok(index.get()),
        None => bail!(
            "Internal error: `{}` needs a dynamic symbol table entry but none was assigned",
            state.db.name(id),
        ),
    }
}

/// Assigns dynamic symbol table indices to every symbol the emitted records
/// will reference. Index 0 stays the null symbol.
fn assign_dynamic_symbol_indices(state: &mut LinkState) {
    let mut next = 1u32;
    for id in state.db.symbol_ids().collect::<Vec<_>>() {
        let interposable = state
            .db
            .is_interposable(id, &state.args)
            .unwrap_or(false);
        let ext = &state.db.symbol(id).ext;
        let referenced = !ext.flags.is_empty()
            || ext.got.slot_count() > 0
            || !ext.plt.is_empty()
            || ext.tls_mask != TlsMask::empty();
        let needs_index = ext.copy_offset.is_some() || (interposable && referenced);
        if needs_index {
            state.db.symbol_mut(id).ext.dynamic_symbol_index =
                Some(std::num::NonZeroU32::new(next).unwrap());
            next += 1;
        }
    }
    state.stats.dynamic_symbols = next - 1;
}

/// Writes the GOT image and the records for slots the loader must fill.
fn build_got_image(
    state: &mut LinkState,
    inputs: &[InputObject],
    out: &mut ApplyOutput,
) -> Result {
    let mut got = vec![0u8; state.got.size as usize];
    let got_address = state.layout.got_address;
    let output = state.args.output_kind;

    if state.plt_scheme == Some(PltScheme::Legacy) {
        if let Some(header) = state.got.header_offset {
            // The word before the legacy GOT pointer is the loader-invoked
            // `blrl`.
            write_insn(&mut got, header as usize, 0x4e80_0021);
        }
    }

    let mut slot = |got: &mut Vec<u8>, offset: u32, value: u32| {
        got[offset as usize..offset as usize + 4].copy_from_slice(&value.to_be_bytes());
    };

    for id in state.db.symbol_ids().collect::<Vec<_>>() {
        if state.db.resolved(id)? != id {
            continue;
        }
        let interposable = state.db.is_interposable(id, &state.args)?;
        let ext = state.db.symbol(id).ext.clone();
        let owner = SymbolRef::Global(id);
        let value = layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;

        if let Some(offset) = ext.got_offsets.addr {
            let ifunc = ext.flags.is_ifunc();
            match plan::addr_slot_reloc(interposable, ifunc, output) {
                Some(DynamicRelocationKind::Irelative) => {
                    out.rela_dyn.push(elf::new_rela(
                        got_address + offset,
                        DynamicRelocationKind::Irelative.ppc32_r_type(),
                        0,
                        value.value() as i32,
                    ));
                }
                Some(kind @ DynamicRelocationKind::Symbolic) => {
                    out.rela_dyn.push(elf::new_rela(
                        got_address + offset,
                        kind.ppc32_r_type(),
                        dynsym_index(state, owner)?,
                        0,
                    ));
                }
                Some(kind @ DynamicRelocationKind::Relative) => {
                    slot(&mut got, offset, value.value());
                    out.rela_dyn.push(elf::new_rela(
                        got_address + offset,
                        kind.ppc32_r_type(),
                        0,
                        value.value() as i32,
                    ));
                }
                _ => slot(&mut got, offset, value.value()),
            }
        }

        let tls_off = tls_offset(state, inputs, owner)?;
        if let Some(offset) = ext.got_offsets.tlsgd {
            let (module_reloc, offset_reloc) = plan::tlsgd_slot_relocs(interposable, output);
            if module_reloc {
                out.rela_dyn.push(elf::new_rela(
                    got_address + offset,
                    DynamicRelocationKind::ModuleId.ppc32_r_type(),
                    if interposable {
                        dynsym_index(state, owner)?
                    } else {
                        0
                    },
                    0,
                ));
            } else {
                // An executable is always module 1.
                slot(&mut got, offset, 1);
            }
            if offset_reloc {
                out.rela_dyn.push(elf::new_rela(
                    got_address + offset + 4,
                    DynamicRelocationKind::ModuleOffset.ppc32_r_type(),
                    dynsym_index(state, owner)?,
                    0,
                ));
            } else if let Some(tls_off) = tls_off {
                slot(&mut got, offset + 4, tls_off.wrapping_sub(DTP_OFFSET));
            }
        }
        if let Some(offset) = ext.got_offsets.tprel {
            if plan::tprel_slot_reloc(interposable, output) {
                out.rela_dyn.push(elf::new_rela(
                    got_address + offset,
                    DynamicRelocationKind::TpOffset.ppc32_r_type(),
                    if interposable {
                        dynsym_index(state, owner)?
                    } else {
                        0
                    },
                    tls_off.map(|t| t as i32).unwrap_or_default(),
                ));
            } else if let Some(tls_off) = tls_off {
                slot(&mut got, offset, tls_off.wrapping_sub(TP_OFFSET));
            }
        }
        if let Some(offset) = ext.got_offsets.dtprel {
            if plan::dtprel_slot_reloc(interposable) {
                out.rela_dyn.push(elf::new_rela(
                    got_address + offset,
                    DynamicRelocationKind::ModuleOffset.ppc32_r_type(),
                    dynsym_index(state, owner)?,
                    0,
                ));
            } else if let Some(tls_off) = tls_off {
                slot(&mut got, offset, tls_off.wrapping_sub(DTP_OFFSET));
            }
        }
    }

    for file in 0..state.db.locals.len() {
        for sym in 0..state.db.locals[file].len() {
            let ext = state.db.locals[file][sym].clone();
            let owner = SymbolRef::Local {
                file: file as u32,
                sym: sym as u32,
            };
            let value =
                layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;
            let tls_off = tls_offset(state, inputs, owner)?;

            if let Some(offset) = ext.got_offsets.addr {
                let ifunc = !ext.plt.is_empty();
                match plan::addr_slot_reloc(false, ifunc, output) {
                    Some(DynamicRelocationKind::Irelative) => {
                        out.rela_dyn.push(elf::new_rela(
                            got_address + offset,
                            DynamicRelocationKind::Irelative.ppc32_r_type(),
                            0,
                            value.value() as i32,
                        ));
                    }
                    Some(kind @ DynamicRelocationKind::Relative) => {
                        slot(&mut got, offset, value.value());
                        out.rela_dyn.push(elf::new_rela(
                            got_address + offset,
                            kind.ppc32_r_type(),
                            0,
                            value.value() as i32,
                        ));
                    }
                    _ => slot(&mut got, offset, value.value()),
                }
            }
            if let Some(offset) = ext.got_offsets.tlsgd {
                let (module_reloc, _) = plan::tlsgd_slot_relocs(false, output);
                if module_reloc {
                    out.rela_dyn.push(elf::new_rela(
                        got_address + offset,
                        DynamicRelocationKind::ModuleId.ppc32_r_type(),
                        0,
                        0,
                    ));
                } else {
                    slot(&mut got, offset, 1);
                }
                if let Some(tls_off) = tls_off {
                    slot(&mut got, offset + 4, tls_off.wrapping_sub(DTP_OFFSET));
                }
            }
            if let Some(offset) = ext.got_offsets.tprel {
                if plan::tprel_slot_reloc(false, output) {
                    out.rela_dyn.push(elf::new_rela(
                        got_address + offset,
                        DynamicRelocationKind::TpOffset.ppc32_r_type(),
                        0,
                        tls_off.map(|t| t as i32).unwrap_or_default(),
                    ));
                } else if let Some(tls_off) = tls_off {
                    slot(&mut got, offset, tls_off.wrapping_sub(TP_OFFSET));
                }
            }
            if let Some(offset) = ext.got_offsets.dtprel {
                if let Some(tls_off) = tls_off {
                    slot(&mut got, offset, tls_off.wrapping_sub(DTP_OFFSET));
                }
            }
        }
    }

    if let Some(offset) = state.tlsld.offset {
        if plan::tlsld_slot_reloc(output) {
            out.rela_dyn.push(elf::new_rela(
                got_address + offset,
                DynamicRelocationKind::ModuleId.ppc32_r_type(),
                0,
                0,
            ));
        } else {
            slot(&mut got, offset, 1);
        }
    }

    out.got = got;
    Ok(())
}

fn emit_copy_relocations(state: &LinkState, out: &mut ApplyOutput) {
    for id in state.db.symbol_ids() {
        let ext = &state.db.symbol(id).ext;
        if let (Some(offset), Some(index)) = (ext.copy_offset, ext.dynamic_symbol_index) {
            out.rela_dyn.push(elf::new_rela(
                state.layout.dynbss_address + offset,
                DynamicRelocationKind::Copy.ppc32_r_type(),
                index.get(),
                0,
            ));
        }
    }
}

/// One record per assigned PLT slot: jump-slot for ordinary symbols,
/// resolver-result for indirect functions.
fn emit_plt_relocations(
    state: &LinkState,
    inputs: &[InputObject],
    out: &mut ApplyOutput,
) -> Result {
    for id in state.db.symbol_ids() {
        if state.db.resolved(id)? != id {
            continue;
        }
        let ext = state.db.symbol(id).ext.clone();
        let owner = SymbolRef::Global(id);
        for plt_id in &ext.plt {
            let entry = state.plt.entry(*plt_id);
            let Some(slot_offset) = entry.offset() else {
                continue;
            };
            let slot_address = state.layout.plt_address + slot_offset;
            if ext.flags.is_ifunc() {
                let value =
                    layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;
                out.rela_plt.push(elf::new_rela(
                    slot_address,
                    DynamicRelocationKind::Irelative.ppc32_r_type(),
                    0,
                    value.value() as i32,
                ));
            } else {
                out.rela_plt.push(elf::new_rela(
                    slot_address,
                    DynamicRelocationKind::JumpSlot.ppc32_r_type(),
                    dynsym_index(state, owner)?,
                    0,
                ));
            }
        }
    }

    for file in 0..state.db.locals.len() {
        for sym in 0..state.db.locals[file].len() {
            let ext = state.db.locals[file][sym].clone();
            let owner = SymbolRef::Local {
                file: file as u32,
                sym: sym as u32,
            };
            for plt_id in &ext.plt {
                let entry = state.plt.entry(*plt_id);
                let Some(slot_offset) = entry.offset() else {
                    continue;
                };
                let value =
                    layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;
                out.rela_plt.push(elf::new_rela(
                    state.layout.plt_address + slot_offset,
                    DynamicRelocationKind::Irelative.ppc32_r_type(),
                    0,
                    value.value() as i32,
                ));
            }
        }
    }
    Ok(())
}
