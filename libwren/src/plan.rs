//! Sizes and lays out the dynamic-linking metadata: chooses the PLT scheme,
//! trims PLT demand that resolves directly, decides copy relocations versus
//! dynamic relocations, allocates GOT and PLT slots and reserves every
//! dynamic-relocation-table entry that the applier will later fill. The
//! reservation logic here and the emission logic in the applier call the
//! same decision functions; the totals have to match exactly.

use crate::LinkState;
use crate::args::CopyRelocations;
use crate::args::OutputKind;
use crate::bail;
use crate::elf;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::Visibility;
use crate::symbol_db::SymbolDefinition;
use crate::symbol_db::SymbolId;
use crate::value_flags::ValueFlags;
use hashbrown::HashMap;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::ppc32::TlsMask;

/// The two mutually exclusive PLT conventions, chosen once per link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PltScheme {
    /// Read-only address table reached through synthesized call stubs.
    Secure,
    /// Writable, loader-patched, directly executed slots.
    Legacy,
}

/// Bump allocator for the GOT with the header-boundary bookkeeping: slots
/// are addressed by signed 16-bit offsets from the GOT pointer, which sits
/// at the header. Allocations that would cross the boundary insert the
/// header there and leave a gap below it that later small requests fill.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct GotAllocator {
    pub(crate) size: u32,
    gap: u32,
    pub(crate) header_offset: Option<u32>,
    header_size: u32,
    boundary: u32,
    legacy: bool,
}

impl GotAllocator {
    pub(crate) fn configure(&mut self, scheme: PltScheme) {
        match scheme {
            PltScheme::Secure => {
                self.header_size = elf::SECURE_GOT_HEADER_SIZE;
                self.boundary = elf::SECURE_GOT_BOUNDARY;
                self.legacy = false;
            }
            PltScheme::Legacy => {
                self.header_size = elf::LEGACY_GOT_HEADER_SIZE;
                self.boundary = elf::LEGACY_GOT_BOUNDARY;
                self.legacy = true;
            }
        }
    }

    pub(crate) fn allocate(&mut self, need: u32) -> u32 {
        if need <= self.gap {
            let offset = self.boundary - self.gap;
            self.gap -= need;
            return offset;
        }
        if self.header_offset.is_none() && self.size + need > self.boundary {
            // Crossing the boundary: the header goes exactly there, and
            // whatever was left below it becomes the gap.
            self.gap = self.boundary - self.size;
            self.header_offset = Some(self.boundary);
            self.size = self.boundary + self.header_size;
        }
        let offset = self.size;
        self.size += need;
        offset
    }

    /// If the link never crossed the boundary, the header goes at the end.
    pub(crate) fn finalise(&mut self) {
        if self.header_offset.is_none() {
            self.header_offset = Some(self.size);
            self.size += self.header_size;
        }
    }

    /// Section-relative offset the GOT pointer symbol addresses slots from.
    /// The legacy header keeps one word (a `blrl`) in front of the pointer.
    pub(crate) fn base_offset(&self) -> u32 {
        let header = self.header_offset.unwrap_or(self.size);
        if self.legacy { header + 4 } else { header }
    }
}

/// The link-wide local-dynamic GOT pair.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TlsLdSlot {
    pub(crate) refcount: u32,
    pub(crate) local_call_sites: u32,
    pub(crate) offset: Option<u32>,
}

pub(crate) fn select_plt_scheme(state: &LinkState) -> PltScheme {
    if state.saw_legacy_plt_call && !state.saw_secure_plt_evidence {
        // Old-style PLT calls with no evidence of the modern convention
        // anywhere: the inputs predate the secure PLT.
        return PltScheme::Legacy;
    }
    if state.args.profile && state.args.output_kind.is_relocatable() {
        // Profiling support patches the directly executed slots, which the
        // secure calling convention doesn't allow.
        return PltScheme::Legacy;
    }
    PltScheme::Secure
}

/// Whether a call to this symbol binds at link time, making PLT indirection
/// unnecessary.
fn call_resolves_directly(state: &LinkState, id: SymbolId) -> Result<bool> {
    let id = state.db.resolved(id)?;
    Ok(match &state.db.symbol(id).def {
        SymbolDefinition::Defined(_) => !state.db.is_interposable(id, &state.args)?,
        SymbolDefinition::Undefined { weak } => {
            // A weak undefined target that no shared object can provide
            // resolves to a branch over the call.
            *weak && !state.args.output_kind.needs_dynamic()
        }
        SymbolDefinition::Indirect(_) => unreachable!(),
    })
}

/// Dynamic relocation needed by an ordinary (address) GOT slot.
pub(crate) fn addr_slot_reloc(
    interposable: bool,
    ifunc: bool,
    output: OutputKind,
) -> Option<DynamicRelocationKind> {
    if ifunc {
        return Some(DynamicRelocationKind::Irelative);
    }
    if interposable {
        return Some(DynamicRelocationKind::Symbolic);
    }
    if output.is_relocatable() {
        return Some(DynamicRelocationKind::Relative);
    }
    None
}

/// (module-id reloc, module-offset reloc) needed by a general-dynamic pair.
/// An executable, PIE included, is always module 1, so its module id is a
/// link-time constant for symbols it defines.
pub(crate) fn tlsgd_slot_relocs(interposable: bool, output: OutputKind) -> (bool, bool) {
    let module = output.is_shared_object() || interposable;
    (module, interposable)
}

pub(crate) fn tprel_slot_reloc(interposable: bool, output: OutputKind) -> bool {
    output.is_shared_object() || interposable
}

pub(crate) fn dtprel_slot_reloc(interposable: bool) -> bool {
    interposable
}

pub(crate) fn tlsld_slot_reloc(output: OutputKind) -> bool {
    output.is_shared_object()
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PltSnapshot {
    pub(crate) entries: u32,
    pub(crate) references: u32,
    pub(crate) stubs: u32,
}

#[tracing::instrument(skip_all, name = "Plan dynamic layout")]
pub(crate) fn size_dynamic_sections(state: &mut LinkState, inputs: &[InputObject]) -> Result {
    let scheme = select_plt_scheme(state);
    state.plt_scheme = Some(scheme);
    state.got.configure(scheme);

    check_undefined_symbols(state)?;
    decide_copy_relocations(state)?;
    assign_plt_offsets(state, scheme)?;
    assign_got_offsets(state)?;

    state.got.finalise();
    state.reserved_rela_dyn += state.dyn_relocs.total();

    state.stats.got_size = state.got.size;
    state.stats.plt_entries = state
        .plt_snapshots
        .values()
        .map(|snapshot| snapshot.entries)
        .sum();
    state.stats.dynamic_relocations_reserved =
        state.reserved_rela_dyn + state.reserved_rela_plt;

    crate::layout::assign_addresses(state, inputs);
    Ok(())
}

/// An undefined strong symbol that is actually referenced is an error unless
/// the runtime loader can still provide it.
fn check_undefined_symbols(state: &LinkState) -> Result {
    if state.args.output_kind.needs_dynamic() {
        return Ok(());
    }
    for id in state.db.symbol_ids() {
        let sym = state.db.symbol(id);
        let referenced = !sym.ext.flags.is_empty()
            || sym.ext.got.slot_count() > 0
            || !sym.ext.plt.is_empty()
            || sym.ext.tls_mask != TlsMask::empty();
        if referenced && matches!(sym.def, SymbolDefinition::Undefined { weak: false }) {
            bail!("Undefined symbol `{}`", sym.name);
        }
    }
    Ok(())
}

/// For data symbols that may be overridden at load time and are referenced
/// directly from the output's own sections: either leave dynamic relocations
/// in place, shadow-copy the symbol into our writable data, or, for
/// protected-visibility symbols built up from a high/low pair, rewrite the
/// pair into an indirect GOT load.
fn decide_copy_relocations(state: &mut LinkState) -> Result {
    if !state.args.output_kind.is_executable() || !state.args.output_kind.needs_dynamic() {
        return Ok(());
    }
    for id in state.db.symbol_ids().collect::<Vec<_>>() {
        let resolved = state.db.resolved(id)?;
        let interposable = state.db.is_interposable(resolved, &state.args)?;
        let sym = state.db.symbol(resolved);
        let flags = sym.ext.flags;
        if !interposable || !flags.needs_direct() || flags.is_function() {
            continue;
        }

        if sym.visibility == Visibility::Protected
            && sym.ext.has_high_ref
            && sym.ext.has_low_ref
            && state.dyn_relocs.total_for_symbol(resolved) == 0
        {
            // All direct references are high/low instruction pairs: patch
            // them into GOT loads and no dynamic relocation lands in any
            // section.
            let ext = &mut state.db.symbol_mut(resolved).ext;
            ext.flags |= ValueFlags::GOT_INDIRECT_REWRITE | ValueFlags::GOT;
            ext.got.addr += 1;
            continue;
        }

        if !flags.contains(ValueFlags::RO_DIRECT_REF) {
            // Every direct reference sits in writable data: dynamic
            // relocations are fine and cheaper than a copy.
            continue;
        }

        match state.args.copy_relocations {
            CopyRelocations::Allowed => {}
            CopyRelocations::Disallowed(reason) => bail!(
                "Direct reference to dynamic symbol `{}` from a read-only section, but \
                 copy relocations are disabled because {reason}",
                sym.name
            ),
        }
        let size = match &sym.def {
            SymbolDefinition::Defined(def) => def.size,
            SymbolDefinition::Undefined { .. } => state.db.symbol(resolved).ext.copy_size_hint,
            SymbolDefinition::Indirect(_) => unreachable!(),
        };
        if size == 0 {
            bail!(
                "Cannot create a copy relocation for `{}`: its size is unknown",
                sym.name
            );
        }
        state.dyn_relocs.remove_for_symbol(resolved);
        let offset = state.dynbss_size.next_multiple_of(8);
        state.dynbss_size = offset + size;
        let ext = &mut state.db.symbol_mut(resolved).ext;
        ext.flags |= ValueFlags::COPY_RELOCATION;
        ext.copy_offset = Some(offset);
        state.reserved_rela_dyn += 1;
    }
    Ok(())
}

fn assign_plt_offsets(state: &mut LinkState, scheme: PltScheme) -> Result {
    let mut slot_offset = match scheme {
        PltScheme::Secure => elf::PLT_HEADER_SIZE,
        PltScheme::Legacy => elf::LEGACY_PLT_HEADER_SIZE,
    };
    let slot_size = match scheme {
        PltScheme::Secure => elf::PLT_SLOT_SIZE,
        PltScheme::Legacy => elf::LEGACY_PLT_SLOT_SIZE,
    };
    let mut stub_offset = 0u32;
    let mut stub_count = 0u32;
    let mut any_assigned = false;
    let mut snapshots: HashMap<SymbolId, PltSnapshot> = HashMap::new();

    // Globals first, then local ifuncs, in stable order.
    for id in state.db.symbol_ids().collect::<Vec<_>>() {
        let resolved = state.db.resolved(id)?;
        if resolved != id {
            continue;
        }
        let ext = &state.db.symbol(id).ext;
        if ext.plt.is_empty() {
            continue;
        }
        let keep = ext.flags.is_ifunc() || !call_resolves_directly(state, id)?;
        if !keep {
            let ext = &mut state.db.symbol_mut(id).ext;
            ext.plt.clear();
            ext.flags.remove(ValueFlags::PLT);
            continue;
        }
        let chain = state.db.symbol(id).ext.plt.clone();
        let mut snapshot = PltSnapshot::default();
        for plt_id in chain {
            let entry = state.plt.entry_mut(plt_id);
            let refcount = entry.refcount();
            if refcount == 0 {
                continue;
            }
            snapshot.references += refcount;
            snapshot.entries += 1;
            entry.state = crate::symbol_db::PltState::Assigned {
                offset: slot_offset,
            };
            slot_offset += slot_size;
            if scheme == PltScheme::Secure {
                entry.stub_offset = Some(stub_offset);
                stub_offset += elf::GLINK_ENTRY_SIZE;
                stub_count += 1;
                snapshot.stubs += 1;
            }
            state.reserved_rela_plt += 1;
            any_assigned = true;
        }
        snapshots.insert(id, snapshot);
    }

    for file in 0..state.db.locals.len() {
        for sym in 0..state.db.locals[file].len() {
            let chain = state.db.locals[file][sym].plt.clone();
            for plt_id in chain {
                let entry = state.plt.entry_mut(plt_id);
                if entry.refcount() == 0 {
                    continue;
                }
                entry.state = crate::symbol_db::PltState::Assigned {
                    offset: slot_offset,
                };
                slot_offset += slot_size;
                if scheme == PltScheme::Secure {
                    entry.stub_offset = Some(stub_offset);
                    stub_offset += elf::GLINK_ENTRY_SIZE;
                    stub_count += 1;
                }
                state.reserved_rela_plt += 1;
                any_assigned = true;
            }
        }
    }

    if any_assigned {
        state.plt_section_size = slot_offset;
        state.glink_size = match scheme {
            PltScheme::Secure => {
                // Call stubs, one lazy-resolution branch word per entry,
                // optionally the TLS fast path, then the shared resolver.
                let mut size = stub_offset + stub_count * 4;
                if state.tls_get_addr_has_stub() {
                    size += elf::TLS_GET_ADDR_STUB_SIZE;
                    state.tls_get_addr_stub = true;
                }
                size + elf::GLINK_RESOLVE_SIZE
            }
            // The loader writes the legacy resolver into the PLT itself.
            PltScheme::Legacy => 0,
        };
    }
    state.stats.call_stubs = stub_count;
    state.plt_snapshots = snapshots;
    Ok(())
}

fn assign_got_offsets(state: &mut LinkState) -> Result {
    for id in state.db.symbol_ids().collect::<Vec<_>>() {
        let resolved = state.db.resolved(id)?;
        if resolved != id {
            continue;
        }
        let interposable = state.db.is_interposable(id, &state.args)?;
        let ifunc = state.db.symbol(id).ext.flags.is_ifunc();
        let counts = state.db.symbol(id).ext.got;
        let output = state.args.output_kind;

        let mut offsets = state.db.symbol(id).ext.got_offsets;
        if counts.addr > 0 {
            offsets.addr = Some(state.got.allocate(elf::GOT_ENTRY_SIZE));
            if addr_slot_reloc(interposable, ifunc, output).is_some() {
                state.reserved_rela_dyn += 1;
            }
        }
        if counts.tlsgd > 0 {
            offsets.tlsgd = Some(state.got.allocate(2 * elf::GOT_ENTRY_SIZE));
            let (module, offset) = tlsgd_slot_relocs(interposable, output);
            state.reserved_rela_dyn += u32::from(module) + u32::from(offset);
        }
        if counts.tprel > 0 {
            offsets.tprel = Some(state.got.allocate(elf::GOT_ENTRY_SIZE));
            if tprel_slot_reloc(interposable, output) {
                state.reserved_rela_dyn += 1;
            }
        }
        if counts.dtprel > 0 {
            offsets.dtprel = Some(state.got.allocate(elf::GOT_ENTRY_SIZE));
            if dtprel_slot_reloc(interposable) {
                state.reserved_rela_dyn += 1;
            }
        }
        state.db.symbol_mut(id).ext.got_offsets = offsets;
        state.stats.got_slots += counts.slot_count();
    }

    for file in 0..state.db.locals.len() {
        for sym in 0..state.db.locals[file].len() {
            let counts = state.db.locals[file][sym].got;
            let output = state.args.output_kind;
            let mut offsets = state.db.locals[file][sym].got_offsets;
            if counts.addr > 0 {
                offsets.addr = Some(state.got.allocate(elf::GOT_ENTRY_SIZE));
                if addr_slot_reloc(false, !state.db.locals[file][sym].plt.is_empty(), output)
                    .is_some()
                {
                    state.reserved_rela_dyn += 1;
                }
            }
            if counts.tlsgd > 0 {
                offsets.tlsgd = Some(state.got.allocate(2 * elf::GOT_ENTRY_SIZE));
                let (module, offset) = tlsgd_slot_relocs(false, output);
                state.reserved_rela_dyn += u32::from(module) + u32::from(offset);
            }
            if counts.tprel > 0 {
                offsets.tprel = Some(state.got.allocate(elf::GOT_ENTRY_SIZE));
                if tprel_slot_reloc(false, output) {
                    state.reserved_rela_dyn += 1;
                }
            }
            if counts.dtprel > 0 {
                offsets.dtprel = Some(state.got.allocate(elf::GOT_ENTRY_SIZE));
            }
            state.db.locals[file][sym].got_offsets = offsets;
            state.stats.got_slots += counts.slot_count();
        }
    }

    if state.tlsld.refcount > 0 {
        state.tlsld.offset = Some(state.got.allocate(2 * elf::GOT_ENTRY_SIZE));
        state.stats.got_slots += 2;
        if tlsld_slot_reloc(state.args.output_kind) {
            state.reserved_rela_dyn += 1;
        }
    }
    Ok(())
}

impl LinkState {
    /// The resolver fast path is worth emitting when `__tls_get_addr` still
    /// has live PLT entries after optimization.
    fn tls_get_addr_has_stub(&self) -> bool {
        self.tls_get_addr_id().is_some_and(|id| {
            self.db
                .symbol(id)
                .ext
                .plt
                .iter()
                .any(|&plt_id| self.plt.entry(plt_id).offset().is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn got_allocator_inserts_header_at_crossing() {
        let mut got = GotAllocator::default();
        got.configure(PltScheme::Secure);
        // Fill to just below the boundary.
        let first = got.allocate(32760);
        assert_eq!(first, 0);
        // This request doesn't fit below the boundary: the header goes in at
        // the crossing point and the request lands after it.
        let crossed = got.allocate(12);
        assert_eq!(
            crossed,
            elf::SECURE_GOT_BOUNDARY + elf::SECURE_GOT_HEADER_SIZE
        );
        // The leftover below the boundary is now a gap that small requests
        // fill before bumping further.
        let gap_fill = got.allocate(4);
        assert_eq!(gap_fill, 32760);
        let gap_fill2 = got.allocate(4);
        assert_eq!(gap_fill2, 32764);
        // Gap exhausted: back to bumping.
        let bumped = got.allocate(4);
        assert_eq!(
            bumped,
            elf::SECURE_GOT_BOUNDARY + elf::SECURE_GOT_HEADER_SIZE + 12
        );
        got.finalise();
        assert_eq!(got.base_offset(), elf::SECURE_GOT_BOUNDARY);
    }

    #[test]
    fn small_got_places_header_at_end() {
        let mut got = GotAllocator::default();
        got.configure(PltScheme::Legacy);
        let a = got.allocate(4);
        let b = got.allocate(8);
        assert_eq!((a, b), (0, 4));
        got.finalise();
        assert_eq!(got.header_offset, Some(12));
        assert_eq!(got.size, 12 + elf::LEGACY_GOT_HEADER_SIZE);
        // Legacy GOT pointer is one word past the header start.
        assert_eq!(got.base_offset(), 16);
    }
}
