//! Branch-reach relaxation and the instruction-prefetch erratum workaround.
//! Both passes grow section tails, which moves every later section, so the
//! engine loops until a complete pass makes no change. Growth is monotonic
//! and bounded by the number of branch relocations and page-boundary slots,
//! so the loop always terminates; the iteration cap is a backstop against
//! bookkeeping bugs, not a tuning knob.

use crate::LinkState;
use crate::ensure;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::SectionRef;
use crate::layout;
use crate::layout::BranchTarget;
use crate::layout::MovedInsn;
use crate::layout::SymbolValue;
use crate::layout::Trampoline;
use crate::symbol_db::SymbolRef;
use foldhash::HashSet;
use linker_utils::elf::RelocationKind;
use linker_utils::ppc32::TRAMPOLINE_SIZE;
use linker_utils::ppc32::distance_fits_branch14;
use linker_utils::ppc32::distance_fits_branch24;
use linker_utils::ppc32::insn;
use linker_utils::ppc32::read_insn;
use linker_utils::ppc32::relocation_type_from_raw;

const MAX_RELAXATION_ITERATIONS: usize = 32;

/// Bytes appended per erratum patch: the moved instruction plus a branch
/// back to the word after its original slot.
const PREFETCH_PATCH_SIZE: u32 = 8;

#[tracing::instrument(skip_all, name = "Relax branches")]
pub(crate) fn run(state: &mut LinkState, inputs: &[InputObject]) -> Result {
    layout::assign_addresses(state, inputs);
    if !state.args.relax && !state.args.prefetch_workaround {
        return Ok(());
    }

    for _iteration in 0..MAX_RELAXATION_ITERATIONS {
        let mut changed = false;
        if state.args.relax {
            changed |= trampoline_pass(state, inputs)?;
        }
        if state.args.prefetch_workaround {
            changed |= prefetch_pass(state, inputs);
        }
        if !changed {
            record_stats(state);
            return Ok(());
        }
        layout::assign_addresses(state, inputs);
    }
    crate::bail!("Internal error: relaxation failed to converge");
}

/// Whether a branch to this symbol binds directly at link time. Calls that
/// go through the PLT reach a stub next to the code instead and never need a
/// trampoline.
fn branch_binds_directly(state: &LinkState, owner: SymbolRef) -> Result<bool> {
    match owner {
        SymbolRef::Local { .. } => Ok(true),
        SymbolRef::Global(id) => {
            let interposable = state.db.is_interposable(id, &state.args)?;
            let ifunc = state
                .db
                .symbol(state.db.resolved(id)?)
                .ext
                .flags
                .is_ifunc();
            Ok(!interposable && !ifunc)
        }
    }
}

fn trampoline_pass(state: &mut LinkState, inputs: &[InputObject]) -> Result<bool> {
    let mut additions: Vec<(SectionRef, BranchTarget)> = Vec::new();
    let mut seen: HashSet<(SectionRef, BranchTarget)> = HashSet::default();

    for (file, obj) in inputs.iter().enumerate() {
        for (sec_idx, section) in obj.sections.iter().enumerate() {
            if !section.is_executable() || !section.is_alloc() {
                continue;
            }
            let section_ref = SectionRef::new(file, sec_idx);
            let placement = &state.layout.placements[file][sec_idx];

            for rel in &section.relocations {
                let Some(info) = relocation_type_from_raw(rel.r_type) else {
                    continue;
                };
                if info.kind != RelocationKind::BranchRelative {
                    continue;
                }
                let owner = state.db.resolve_ref(file, rel.symbol, obj.num_local_symbols);
                if !branch_binds_directly(state, owner)? {
                    continue;
                }
                let value =
                    layout::resolve_symbol_value(&state.db, &state.layout, inputs, owner)?;
                let target_address = match value {
                    SymbolValue::Address(a) => a.wrapping_add(rel.addend as u32),
                    // Absolute branch targets are rare but a trampoline works
                    // for them just as well.
                    SymbolValue::Absolute(a) => a.wrapping_add(rel.addend as u32),
                    SymbolValue::Undefined { .. } => continue,
                };
                let place = placement.address + rel.offset;
                let distance = i64::from(target_address) - i64::from(place);
                let fits = match info.bit_width {
                    26 => distance_fits_branch24(distance),
                    _ => distance_fits_branch14(distance),
                };
                if fits {
                    continue;
                }
                let target = BranchTarget {
                    symbol: owner,
                    addend: rel.addend,
                };
                if placement.trampoline_for(target).is_some() {
                    continue;
                }
                if seen.insert((section_ref, target)) {
                    additions.push((section_ref, target));
                }
            }
        }
    }

    let changed = !additions.is_empty();
    for (section_ref, target) in additions {
        let data_len = inputs[section_ref.file as usize].sections[section_ref.section as usize]
            .mem_size;
        let placement =
            &mut state.layout.placements[section_ref.file as usize][section_ref.section as usize];
        let offset = data_len + placement.extra;
        placement.trampolines.push(Trampoline { target, offset });
        placement.extra += TRAMPOLINE_SIZE as u32;
    }
    Ok(changed)
}

/// Whether the word at `offset` may be relocated to a patch area. Branches
/// redirect the instruction stream themselves and are not affected by the
/// erratum; anything with a pc-relative relocation would change meaning when
/// moved.
fn word_is_movable(section: &crate::input::InputSection, offset: u32) -> bool {
    let word = read_insn(&section.data, offset as usize);
    if insn::is_direct_branch(word) || insn::is_conditional_branch(word) {
        return false;
    }
    !section.relocations.iter().any(|rel| {
        if rel.offset < offset || rel.offset >= offset + 4 {
            return false;
        }
        relocation_type_from_raw(rel.r_type).is_none_or(|info| info.pc_relative)
    })
}

fn prefetch_pass(state: &mut LinkState, inputs: &[InputObject]) -> bool {
    let page = state.args.page_size;
    let mut additions: Vec<(SectionRef, u32)> = Vec::new();

    for (file, obj) in inputs.iter().enumerate() {
        for (sec_idx, section) in obj.sections.iter().enumerate() {
            if !section.is_executable() || !section.is_alloc() || section.data.len() < 4 {
                continue;
            }
            let section_ref = SectionRef::new(file, sec_idx);
            let placement = &state.layout.placements[file][sec_idx];
            let len = section.data.len() as u32 & !3;

            // First instruction word whose address ends the page.
            let mut offset = (page - 4).wrapping_sub(placement.address % page) % page;
            while offset < len {
                if placement.moved_to(offset).is_none() && word_is_movable(section, offset) {
                    additions.push((section_ref, offset));
                }
                offset += page;
            }
        }
    }

    let changed = !additions.is_empty();
    for (section_ref, orig_offset) in additions {
        let data_len = inputs[section_ref.file as usize].sections[section_ref.section as usize]
            .mem_size;
        let placement =
            &mut state.layout.placements[section_ref.file as usize][section_ref.section as usize];
        let patch_offset = data_len + placement.extra;
        placement.moved.push(MovedInsn {
            orig_offset,
            patch_offset,
        });
        placement.extra += PREFETCH_PATCH_SIZE;
    }
    changed
}

fn record_stats(state: &mut LinkState) {
    state.stats.trampolines = state
        .layout
        .placements
        .iter()
        .flatten()
        .map(|p| p.trampolines.len() as u32)
        .sum();
    state.stats.prefetch_patches = state
        .layout
        .placements
        .iter()
        .flatten()
        .map(|p| p.moved.len() as u32)
        .sum();
}

/// Fills in the bytes a section's tail grew by: trampoline islands and
/// erratum patches. Called by the applier once addresses are final.
pub(crate) fn write_section_growth(
    state: &LinkState,
    inputs: &[InputObject],
    section_ref: SectionRef,
    out: &mut [u8],
) -> Result {
    let section = &inputs[section_ref.file as usize].sections[section_ref.section as usize];
    let placement =
        &state.layout.placements[section_ref.file as usize][section_ref.section as usize];

    for trampoline in &placement.trampolines {
        let value = layout::resolve_symbol_value(
            &state.db,
            &state.layout,
            inputs,
            trampoline.target.symbol,
        )?;
        let target = value.value().wrapping_add(trampoline.target.addend as u32);
        let at = trampoline.offset as usize;
        linker_utils::ppc32::write_trampoline(&mut out[at..at + TRAMPOLINE_SIZE as usize], target);
    }

    for moved in &placement.moved {
        let patch_address = placement.address + moved.patch_offset;
        let resume_address = placement.address + moved.orig_offset + 4;
        let moved_word = read_insn(&section.data, moved.orig_offset as usize);

        // Original slot: jump to the patch.
        let to_patch = i64::from(patch_address) - i64::from(placement.address + moved.orig_offset);
        ensure!(
            distance_fits_branch24(to_patch),
            "Internal error: prefetch patch out of branch range"
        );
        linker_utils::ppc32::write_insn(
            out,
            moved.orig_offset as usize,
            insn::b(to_patch as i32),
        );

        // Patch: the moved instruction, then back to the next word.
        let back = i64::from(resume_address) - i64::from(patch_address + 4);
        ensure!(
            distance_fits_branch24(back),
            "Internal error: prefetch patch return out of branch range"
        );
        linker_utils::ppc32::write_insn(out, moved.patch_offset as usize, moved_word);
        linker_utils::ppc32::write_insn(
            out,
            moved.patch_offset as usize + 4,
            insn::b(back as i32),
        );
    }
    Ok(())
}
