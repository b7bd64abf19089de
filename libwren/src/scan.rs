//! First pass over the input relocations. Classifies every record and
//! derives GOT/PLT/TLS/dynamic-relocation demand from it. Sections are
//! scanned in parallel producing read-only partial results which are then
//! merged into the symbol extensions single-threaded, so no shared counter
//! is ever mutated concurrently.

use crate::LinkState;
use crate::args::Args;
use crate::bail;
use crate::ensure;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::InputRelocation;
use crate::input::InputSection;
use crate::input::SectionRef;
use crate::input::SymbolKind;
use crate::symbol_db::PltKey;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolDefinition;
use crate::symbol_db::SymbolRef;
use crate::value_flags::ValueFlags;
use itertools::Itertools;
use linker_utils::elf::RelocationKind;
use linker_utils::elf::RelocationSpecial;
use linker_utils::ppc32::TlsMask;
use linker_utils::ppc32::relocation_type_from_raw;
use linker_utils::ppc32::rel_type_to_string;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;

/// The GOT access kinds a relocation can demand. Local-dynamic is link-wide
/// rather than per-symbol: every module shares one module-id pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GotAccess {
    Addr,
    TlsGd,
    TlsLd,
    TpRel,
    DtpRel,
}

/// One effect derived from a scanned relocation. Applied during the merge
/// step.
#[derive(Clone, Debug)]
enum ScanOp {
    Flags {
        owner: SymbolRef,
        flags: ValueFlags,
    },
    GotRef {
        owner: SymbolRef,
        access: GotAccess,
    },
    /// A `__tls_get_addr` call site using the given model.
    TlsCall {
        owner: SymbolRef,
        local_dynamic: bool,
    },
    PltRef {
        owner: SymbolRef,
        key: PltKey,
    },
    TlsBits {
        owner: SymbolRef,
        bits: TlsMask,
    },
    SdaRef {
        owner: SymbolRef,
    },
    HighRef {
        owner: SymbolRef,
    },
    LowRef {
        owner: SymbolRef,
    },
    DynReloc {
        owner: SymbolRef,
        section: SectionRef,
        pc_rel: bool,
        ifunc: bool,
    },
}

#[derive(Default)]
struct SectionScan {
    ops: Vec<ScanOp>,
    has_tls_relocations: bool,
    uses_plt_calls: bool,
    saw_rel16: bool,
    has_static_tls: bool,
    errors: Vec<String>,
}

/// Whether the referenced symbol resolves through a runtime-selected
/// implementation.
fn is_ifunc_ref(db: &SymbolDb, inputs: &[InputObject], owner: SymbolRef) -> Result<bool> {
    Ok(match owner {
        SymbolRef::Local { file, sym } => {
            inputs[file as usize].symbols[sym as usize].kind == SymbolKind::IndirectFunction
        }
        SymbolRef::Global(id) => {
            let id = db.resolved(id)?;
            match &db.symbol(id).def {
                SymbolDefinition::Defined(def) => def.kind == SymbolKind::IndirectFunction,
                _ => false,
            }
        }
    })
}

/// Whether the reference is to a function. For undefined symbols the
/// definition can't tell us, so the referencing symbol-table entry's
/// declared type decides. The applier calls this with the same inputs, so
/// both sides make identical dynamic-relocation decisions.
pub(crate) fn is_function_ref(
    db: &SymbolDb,
    inputs: &[InputObject],
    owner: SymbolRef,
    ref_kind: SymbolKind,
) -> Result<bool> {
    let is_function_kind =
        |kind| matches!(kind, SymbolKind::Function | SymbolKind::IndirectFunction);
    Ok(match owner {
        SymbolRef::Local { file, sym } => {
            is_function_kind(inputs[file as usize].symbols[sym as usize].kind)
        }
        SymbolRef::Global(id) => {
            let id = db.resolved(id)?;
            match &db.symbol(id).def {
                SymbolDefinition::Defined(def) => is_function_kind(def.kind),
                SymbolDefinition::Undefined { .. } => is_function_kind(ref_kind),
                SymbolDefinition::Indirect(_) => unreachable!(),
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn scan_one_relocation(
    rel: &InputRelocation,
    section: &InputSection,
    section_ref: SectionRef,
    object: &InputObject,
    db: &SymbolDb,
    inputs: &[InputObject],
    args: &Args,
    out: &mut SectionScan,
) -> Result {
    ensure!(
        (rel.symbol as usize) < object.symbols.len(),
        "Relocation references symbol index {} outside the symbol table",
        rel.symbol
    );
    let Some(info) = relocation_type_from_raw(rel.r_type) else {
        bail!(
            "Unsupported relocation type {} against `{}`",
            rel_type_to_string(rel.r_type),
            ref_name(db, object, rel.symbol),
        );
    };
    if info.special == RelocationSpecial::ForceDynamic {
        bail!(
            "Relocation {} is only valid in linker-generated dynamic sections",
            info.name
        );
    }

    // Canonicalise aliases straight away so every piece of bookkeeping
    // lands on the symbol that carries the definition state.
    let owner =
        match db.resolve_ref(section_ref.file as usize, rel.symbol, object.num_local_symbols) {
            SymbolRef::Global(id) => SymbolRef::Global(db.resolved(id)?),
            local => local,
        };
    let is_global = matches!(owner, SymbolRef::Global(_));
    let interposable = match owner {
        SymbolRef::Global(id) => db.is_interposable(id, args)?,
        SymbolRef::Local { .. } => false,
    };
    let ifunc = is_ifunc_ref(db, inputs, owner)?;
    let relocatable = args.output_kind.is_relocatable();
    let alloc = section.is_alloc();
    let writable = section.is_writable();

    // Indirect functions always get PLT indirection, including for data
    // references and in plain executables.
    if ifunc {
        out.ops.push(ScanOp::PltRef {
            owner,
            key: PltKey {
                got2: None,
                addend: 0,
            },
        });
        out.ops.push(ScanOp::Flags {
            owner,
            flags: ValueFlags::PLT | ValueFlags::IFUNC | ValueFlags::FUNCTION,
        });
    }

    match info.kind {
        RelocationKind::None => {}

        RelocationKind::Absolute | RelocationKind::Branch => {
            let mut flags = ValueFlags::DIRECT;
            if alloc && !writable {
                flags |= ValueFlags::RO_DIRECT_REF;
            }
            out.ops.push(ScanOp::Flags { owner, flags });
            if rel.r_type == object::elf::R_PPC_ADDR16_HA {
                out.ops.push(ScanOp::HighRef { owner });
            }
            if rel.r_type == object::elf::R_PPC_ADDR16_LO {
                out.ops.push(ScanOp::LowRef { owner });
            }

            if !alloc {
                // Absolute values in non-allocated sections are patched if
                // resolvable and never get dynamic relocations.
            } else if relocatable {
                if info.kind == RelocationKind::Branch {
                    bail!(
                        "Relocation {} against `{}` cannot be used in position-independent \
                         output",
                        info.name,
                        ref_name(db, object, rel.symbol),
                    );
                }
                if info.byte_size != 4 {
                    bail!(
                        "Relocation {} against `{}` cannot be used in position-independent \
                         output; recompile with -fPIC",
                        info.name,
                        ref_name(db, object, rel.symbol),
                    );
                }
                out.ops.push(ScanOp::DynReloc {
                    owner,
                    section: section_ref,
                    pc_rel: false,
                    ifunc,
                });
            } else if interposable && args.output_kind.needs_dynamic() {
                let ref_kind = object.symbols[rel.symbol as usize].kind;
                if is_function_ref(db, inputs, owner, ref_kind)? && !ifunc {
                    // Address-taken interposable function: point the
                    // reference at a PLT entry so the address is consistent
                    // with calls from other modules.
                    out.ops.push(ScanOp::Flags {
                        owner,
                        flags: ValueFlags::PLT | ValueFlags::FUNCTION,
                    });
                    out.ops.push(ScanOp::PltRef {
                        owner,
                        key: PltKey {
                            got2: None,
                            addend: 0,
                        },
                    });
                } else if info.byte_size == 4 {
                    // Candidate for a copy relocation; the planner decides
                    // and either keeps or drops these records.
                    out.ops.push(ScanOp::DynReloc {
                        owner,
                        section: section_ref,
                        pc_rel: false,
                        ifunc,
                    });
                } else {
                    bail!(
                        "Direct {} reference to dynamic symbol `{}` cannot be resolved at \
                         link time",
                        info.name,
                        ref_name(db, object, rel.symbol),
                    );
                }
            }
        }

        RelocationKind::Relative => {
            if rel.r_type == object::elf::R_PPC_REL16
                || rel.r_type == object::elf::R_PPC_REL16_LO
                || rel.r_type == object::elf::R_PPC_REL16_HI
                || rel.r_type == object::elf::R_PPC_REL16_HA
            {
                out.saw_rel16 = true;
            }
            if interposable && alloc {
                if relocatable {
                    bail!(
                        "PC-relative relocation {} against interposable symbol `{}` cannot \
                         be used in position-independent output",
                        info.name,
                        ref_name(db, object, rel.symbol),
                    );
                }
                if info.byte_size == 4 && args.output_kind.needs_dynamic() {
                    out.ops.push(ScanOp::DynReloc {
                        owner,
                        section: section_ref,
                        pc_rel: true,
                        ifunc,
                    });
                }
            }
        }

        RelocationKind::BranchRelative => {
            if rel.r_type == object::elf::R_PPC_LOCAL24PC && interposable {
                bail!(
                    "{} used against interposable symbol `{}`",
                    info.name,
                    ref_name(db, object, rel.symbol),
                );
            }
            if is_global && (interposable || ifunc) {
                out.ops.push(ScanOp::Flags {
                    owner,
                    flags: ValueFlags::PLT | ValueFlags::FUNCTION,
                });
                out.ops.push(ScanOp::PltRef {
                    owner,
                    key: PltKey {
                        got2: None,
                        addend: 0,
                    },
                });
            }
        }

        RelocationKind::PltBranch | RelocationKind::PltAddr => {
            if !is_global && !ifunc {
                bail!(
                    "{} requires PLT indirection but `{}` has no global visibility",
                    info.name,
                    ref_name(db, object, rel.symbol),
                );
            }
            if info.kind == RelocationKind::PltBranch {
                out.uses_plt_calls = true;
            }
            let key = if rel.addend != 0 {
                // PIC callers fetch the PLT address through their own
                // auxiliary GOT-pointer section; the addend selects the slot.
                let got2 = object
                    .section_index_by_name(".got2")
                    .map(|s| SectionRef::new(section_ref.file as usize, s));
                PltKey {
                    got2,
                    addend: rel.addend as u32,
                }
            } else {
                PltKey {
                    got2: None,
                    addend: 0,
                }
            };
            out.ops.push(ScanOp::Flags {
                owner,
                flags: ValueFlags::PLT | ValueFlags::FUNCTION,
            });
            out.ops.push(ScanOp::PltRef { owner, key });
        }

        RelocationKind::Got => {
            out.ops.push(ScanOp::Flags {
                owner,
                flags: ValueFlags::GOT,
            });
            out.ops.push(ScanOp::GotRef {
                owner,
                access: GotAccess::Addr,
            });
        }

        RelocationKind::GotTlsGd => {
            out.has_tls_relocations = true;
            out.ops.push(ScanOp::GotRef {
                owner,
                access: GotAccess::TlsGd,
            });
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::GD,
            });
            if matches!(
                rel.r_type,
                object::elf::R_PPC_GOT_TLSGD16 | object::elf::R_PPC_GOT_TLSGD16_LO
            ) {
                out.ops.push(ScanOp::TlsCall {
                    owner,
                    local_dynamic: false,
                });
            }
        }

        RelocationKind::GotTlsLd => {
            out.has_tls_relocations = true;
            out.ops.push(ScanOp::GotRef {
                owner,
                access: GotAccess::TlsLd,
            });
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::LD,
            });
            if matches!(
                rel.r_type,
                object::elf::R_PPC_GOT_TLSLD16 | object::elf::R_PPC_GOT_TLSLD16_LO
            ) {
                out.ops.push(ScanOp::TlsCall {
                    owner,
                    local_dynamic: true,
                });
            }
        }

        RelocationKind::GotTpRel => {
            out.has_tls_relocations = true;
            out.has_static_tls = true;
            out.ops.push(ScanOp::GotRef {
                owner,
                access: GotAccess::TpRel,
            });
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::TPREL,
            });
        }

        RelocationKind::GotDtpRel => {
            out.has_tls_relocations = true;
            out.ops.push(ScanOp::GotRef {
                owner,
                access: GotAccess::DtpRel,
            });
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::DTPREL,
            });
        }

        RelocationKind::TpRel => {
            out.has_tls_relocations = true;
            out.has_static_tls = true;
            if args.output_kind.is_shared_object() {
                bail!(
                    "Relocation {} against `{}` cannot be used in a shared object",
                    info.name,
                    ref_name(db, object, rel.symbol),
                );
            }
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::TPREL,
            });
        }

        RelocationKind::DtpRel => {
            out.has_tls_relocations = true;
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::DTPREL,
            });
        }

        RelocationKind::TlsMark | RelocationKind::TlsGdMark | RelocationKind::TlsLdMark => {
            out.has_tls_relocations = true;
            out.ops.push(ScanOp::TlsBits {
                owner,
                bits: TlsMask::MARKERS,
            });
        }

        RelocationKind::SdaRelative | RelocationKind::SdaBased21 => {
            if args.output_kind.is_relocatable() {
                bail!(
                    "Small-data relocation {} cannot be used in position-independent output",
                    info.name
                );
            }
            out.ops.push(ScanOp::SdaRef { owner });
            out.ops.push(ScanOp::Flags {
                owner,
                flags: ValueFlags::DIRECT,
            });
        }

        RelocationKind::SectionOffset => {}

        RelocationKind::DtpMod
        | RelocationKind::Copy
        | RelocationKind::GlobDat
        | RelocationKind::JumpSlot
        | RelocationKind::Irelative => unreachable!("rejected above"),
    }

    Ok(())
}

fn ref_name<'a>(db: &'a SymbolDb, object: &'a InputObject, sym_index: u32) -> &'a str {
    let sym = &object.symbols[sym_index as usize];
    if (sym_index as usize) < object.num_local_symbols {
        if sym.name.is_empty() { "<local>" } else { &sym.name }
    } else {
        db.lookup(&sym.name)
            .map(|id| db.name(id))
            .unwrap_or(&sym.name)
    }
}

fn scan_section(
    section_ref: SectionRef,
    inputs: &[InputObject],
    db: &SymbolDb,
    args: &Args,
) -> SectionScan {
    let object = &inputs[section_ref.file as usize];
    let section = &object.sections[section_ref.section as usize];
    let mut out = SectionScan::default();
    for rel in &section.relocations {
        if let Err(error) = scan_one_relocation(
            rel, section, section_ref, object, db, inputs, args, &mut out,
        ) {
            out.errors.push(format!(
                "{}({}+0x{:x}): {error}",
                object.name, section.name, rel.offset
            ));
        }
    }
    out
}

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_inputs(state: &mut LinkState, inputs: &[InputObject]) -> Result {
    let section_refs = inputs
        .iter()
        .enumerate()
        .flat_map(|(file, obj)| {
            (0..obj.sections.len()).map(move |section| SectionRef::new(file, section))
        })
        .collect_vec();

    let partials: Vec<(SectionRef, SectionScan)> = section_refs
        .into_par_iter()
        .map(|section_ref| {
            (
                section_ref,
                scan_section(section_ref, inputs, &state.db, &state.args),
            )
        })
        .collect();

    // Everything below is the single-threaded reduction: the only place
    // where shared counters are mutated.
    let mut errors = Vec::new();
    let mut per_file_plt_calls = vec![false; inputs.len()];
    let mut per_file_rel16 = vec![false; inputs.len()];

    for (section_ref, partial) in partials {
        errors.extend(partial.errors);
        if partial.has_tls_relocations {
            state.tls_sections.push(section_ref);
        }
        state.has_static_tls |= partial.has_static_tls;
        per_file_plt_calls[section_ref.file as usize] |= partial.uses_plt_calls;
        per_file_rel16[section_ref.file as usize] |= partial.saw_rel16;

        for op in partial.ops {
            apply_op(state, op)?;
        }
    }

    for (plt_calls, rel16) in per_file_plt_calls.iter().zip(&per_file_rel16) {
        if *plt_calls && !*rel16 {
            state.saw_legacy_plt_call = true;
        }
        state.saw_secure_plt_evidence |= *rel16;
    }

    if !errors.is_empty() {
        for error in &errors {
            crate::error::warning(error);
        }
        bail!(
            "{} error(s) during relocation scanning, first: {}",
            errors.len(),
            errors[0]
        );
    }
    Ok(())
}

fn apply_op(state: &mut LinkState, op: ScanOp) -> Result {
    match op {
        ScanOp::Flags { owner, flags } => {
            if let SymbolRef::Global(id) = owner {
                state.db.symbol_mut(id).ext.flags.merge(flags);
            }
        }
        ScanOp::GotRef { owner, access } => {
            if access == GotAccess::TlsLd {
                state.tlsld.refcount += 1;
                return Ok(());
            }
            let counts = match owner {
                SymbolRef::Global(id) => &mut state.db.symbol_mut(id).ext.got,
                SymbolRef::Local { file, sym } => &mut state.db.local_ext_mut(file, sym).got,
            };
            match access {
                GotAccess::Addr => counts.addr += 1,
                GotAccess::TlsGd => counts.tlsgd += 1,
                GotAccess::TpRel => counts.tprel += 1,
                GotAccess::DtpRel => counts.dtprel += 1,
                GotAccess::TlsLd => unreachable!(),
            }
        }
        ScanOp::TlsCall {
            owner,
            local_dynamic,
        } => {
            if let SymbolRef::Global(id) = owner {
                let ext = &mut state.db.symbol_mut(id).ext;
                if local_dynamic {
                    ext.ld_call_sites += 1;
                } else {
                    ext.gd_call_sites += 1;
                }
            } else if local_dynamic {
                state.tlsld.local_call_sites += 1;
            }
        }
        ScanOp::PltRef { owner, key } => {
            let chain = match owner {
                SymbolRef::Global(id) => &mut state.db.symbol_mut(id).ext.plt,
                SymbolRef::Local { file, sym } => &mut state.db.local_ext_mut(file, sym).plt,
            };
            state.plt.reference(chain, key)?;
        }
        ScanOp::TlsBits { owner, bits } => match owner {
            SymbolRef::Global(id) => state.db.symbol_mut(id).ext.tls_mask |= bits,
            SymbolRef::Local { file, sym } => state.db.local_ext_mut(file, sym).tls_mask |= bits,
        },
        ScanOp::SdaRef { owner } => {
            if let SymbolRef::Global(id) = owner {
                state.db.symbol_mut(id).ext.has_sda_ref = true;
            }
        }
        ScanOp::HighRef { owner } => {
            if let SymbolRef::Global(id) = owner {
                state.db.symbol_mut(id).ext.has_high_ref = true;
            }
        }
        ScanOp::LowRef { owner } => {
            if let SymbolRef::Global(id) = owner {
                state.db.symbol_mut(id).ext.has_low_ref = true;
            }
        }
        ScanOp::DynReloc {
            owner,
            section,
            pc_rel,
            ifunc,
        } => {
            state.dyn_relocs.add(owner, section, pc_rel, ifunc);
        }
    }
    Ok(())
}
