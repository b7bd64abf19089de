//! Strength reduction for TLS access sequences. Pass A verifies that every
//! marker-less general/local-dynamic access is followed by the expected
//! `__tls_get_addr` call; pass B then downgrades accesses to the weakest
//! sufficient model. If verification fails anywhere, optimization is
//! disabled for the whole link: partially rewritten sequences sharing code
//! with unverified ones could otherwise be miscompiled, so there is no
//! per-symbol fallback.

use crate::LinkState;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::SectionRef;
use crate::symbol_db::PltKey;
use crate::symbol_db::SymbolRef;
use linker_utils::elf::RelocationKind;
use linker_utils::ppc32::TlsMask;
use linker_utils::ppc32::relocation_type_from_raw;

/// Whether this relocation form sits on the instruction directly preceding
/// the resolver call. The high-half forms live on an earlier `addis` and are
/// not adjacent to the call.
fn precedes_resolver_call(r_type: u32) -> bool {
    matches!(
        r_type,
        object::elf::R_PPC_GOT_TLSGD16
            | object::elf::R_PPC_GOT_TLSGD16_LO
            | object::elf::R_PPC_GOT_TLSLD16
            | object::elf::R_PPC_GOT_TLSLD16_LO
    )
}

#[tracing::instrument(skip_all, name = "Optimize TLS sequences")]
pub(crate) fn optimize(state: &mut LinkState, inputs: &[InputObject]) -> Result {
    verify_call_sequences(state, inputs)?;
    if state.tls_opt_disabled || state.args.output_kind.is_shared_object() {
        // A shared object never knows the defining module at link time, so
        // no downgrade is possible there either.
        return Ok(());
    }
    downgrade_accesses(state)
}

/// Pass A. Read-only: scans every section flagged as containing TLS
/// relocations and checks the call structure of marker-less sequences.
fn verify_call_sequences(state: &mut LinkState, inputs: &[InputObject]) -> Result {
    let tls_sections = state.tls_sections.clone();
    for section_ref in tls_sections {
        let object = &inputs[section_ref.file as usize];
        let section = &object.sections[section_ref.section as usize];
        for rel in &section.relocations {
            let Some(info) = relocation_type_from_raw(rel.r_type) else {
                continue; // already reported by the scanner
            };
            if !matches!(
                info.kind,
                RelocationKind::GotTlsGd | RelocationKind::GotTlsLd
            ) || !precedes_resolver_call(rel.r_type)
            {
                continue;
            }
            let call_offset = rel.offset + 2;
            let mut has_marker = false;
            let mut has_call = false;
            for other in &section.relocations {
                if other.offset != call_offset {
                    continue;
                }
                let Some(other_info) = relocation_type_from_raw(other.r_type) else {
                    continue;
                };
                match other_info.kind {
                    RelocationKind::TlsGdMark | RelocationKind::TlsLdMark => has_marker = true,
                    RelocationKind::BranchRelative | RelocationKind::PltBranch => {
                        let owner = state.db.resolve_ref(
                            section_ref.file as usize,
                            other.symbol,
                            object.num_local_symbols,
                        );
                        if let SymbolRef::Global(id) = owner {
                            has_call = state.tls_get_addr_id() == Some(id);
                        }
                    }
                    _ => {}
                }
            }
            if !has_marker && !has_call {
                tracing::trace!(
                    "{}({}+0x{:x}): dynamic TLS access without resolver call; TLS \
                     optimization disabled",
                    object.name,
                    section.name,
                    rel.offset
                );
                state.tls_opt_disabled = true;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Pass B. Rewrites the access masks and shrinks the GOT demand. Operating
/// purely on the masks makes the pass idempotent: once the strong bits are
/// cleared, a re-run changes nothing.
fn downgrade_accesses(state: &mut LinkState) -> Result {
    let mut resolver_calls_removed = 0u32;

    for id in state.db.symbol_ids().collect::<Vec<_>>() {
        let defined = !state.db.is_undefined(id)?;
        let ext = &mut state.db.symbol_mut(id).ext;

        if ext.tls_mask.contains(TlsMask::GD) {
            ext.tls_mask.remove(TlsMask::GD);
            if defined {
                // General-dynamic to local-exec: the pair of GOT words and
                // the resolver call both disappear.
                ext.tls_mask.insert(TlsMask::TPREL);
            } else {
                // To initial-exec: one thread-pointer-relative word remains.
                ext.tls_mask.insert(TlsMask::TPREL_GD);
                ext.got.tprel += ext.got.tlsgd;
            }
            ext.got.tlsgd = 0;
            resolver_calls_removed += ext.gd_call_sites;
        }

        if ext.tls_mask.contains(TlsMask::LD) {
            ext.tls_mask.remove(TlsMask::LD);
            ext.tls_mask.insert(TlsMask::TPREL);
            resolver_calls_removed += ext.ld_call_sites;
        }
    }

    for locals in &mut state.db.locals {
        for ext in locals {
            if ext.tls_mask.contains(TlsMask::GD) {
                // Local symbols always resolve within the link.
                ext.tls_mask.remove(TlsMask::GD);
                ext.tls_mask.insert(TlsMask::TPREL);
                ext.got.tlsgd = 0;
            }
            if ext.tls_mask.contains(TlsMask::LD) {
                ext.tls_mask.remove(TlsMask::LD);
                ext.tls_mask.insert(TlsMask::TPREL);
            }
        }
    }

    if state.tlsld.refcount > 0 {
        // The link-wide local-dynamic pair is no longer needed.
        resolver_calls_removed += state.tlsld.local_call_sites;
        state.tlsld.refcount = 0;
        state.tlsld.local_call_sites = 0;
    }

    if resolver_calls_removed > 0 {
        release_resolver_call_stubs(state, resolver_calls_removed)?;
    }
    Ok(())
}

fn release_resolver_call_stubs(state: &mut LinkState, count: u32) -> Result {
    let Some(id) = state.tls_get_addr_id() else {
        return Ok(());
    };
    let chain = state.db.symbol(id).ext.plt.clone();
    let mut remaining = count;
    // Prefer the ordinary-convention entry; PIC entries only if the plain
    // one runs dry.
    let mut ordered: Vec<_> = chain.iter().copied().collect();
    ordered.sort_by_key(|&plt_id| {
        state.plt.entry(plt_id).key
            != PltKey {
                got2: None,
                addend: 0,
            }
    });
    for plt_id in ordered {
        while remaining > 0 && state.plt.entry(plt_id).refcount() > 0 {
            state.plt.entry_mut(plt_id).sub_ref()?;
            remaining -= 1;
        }
    }
    Ok(())
}

impl LinkState {
    pub(crate) fn tls_get_addr_id(&self) -> Option<crate::symbol_db::SymbolId> {
        self.db.tls_get_addr
    }
}

/// Used by the relocation applier: whether a general-dynamic sequence for
/// this mask should be rewritten, and to what.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GdRewrite {
    None,
    ToInitialExec,
    ToLocalExec,
}

pub(crate) fn gd_rewrite_for_mask(mask: TlsMask) -> GdRewrite {
    if mask.contains(TlsMask::GD) {
        GdRewrite::None
    } else if mask.contains(TlsMask::TPREL_GD) {
        GdRewrite::ToInitialExec
    } else if mask.contains(TlsMask::TPREL) {
        GdRewrite::ToLocalExec
    } else {
        GdRewrite::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkState;
    use crate::args::Args;
    use crate::input::InputObject;
    use crate::input::InputSection;
    use crate::input::InputSymbol;
    use crate::input::SymbolBinding;
    use crate::input::SymbolKind;
    use crate::input::SymbolPlacement;
    use crate::input::Visibility;
    use crate::symbol_db::SymbolDb;
    use linker_utils::elf::shf;

    fn state_with_gd_symbol() -> (LinkState, crate::symbol_db::SymbolId) {
        let mut obj = InputObject::new("a.o");
        obj.add_section(InputSection::progbits(
            ".tdata",
            shf::ALLOC.with(shf::WRITE).with(shf::TLS),
            vec![0; 8],
        ));
        obj.add_symbol(InputSymbol {
            name: "v".to_owned(),
            value: 0,
            size: 4,
            placement: SymbolPlacement::Section(0),
            binding: SymbolBinding::Global,
            kind: SymbolKind::Tls,
            visibility: Visibility::Default,
        });
        let db = SymbolDb::build(std::slice::from_ref(&obj)).unwrap();
        let mut state = LinkState::new(Args::default(), db);
        let id = state.db.lookup("v").unwrap();
        let ext = &mut state.db.symbol_mut(id).ext;
        ext.tls_mask = TlsMask::GD;
        ext.got.tlsgd = 1;
        ext.gd_call_sites = 1;
        (state, id)
    }

    /// Running the rewrite pass a second time must not change any mask or
    /// count: everything it does is keyed off the strong bits it clears.
    #[test]
    fn downgrade_is_idempotent() {
        let (mut state, id) = state_with_gd_symbol();
        downgrade_accesses(&mut state).unwrap();
        let ext = state.db.symbol(id).ext.clone();
        assert_eq!(ext.tls_mask, TlsMask::TPREL);
        assert_eq!(ext.got.slot_count(), 0);

        downgrade_accesses(&mut state).unwrap();
        let again = state.db.symbol(id).ext.clone();
        assert_eq!(again.tls_mask, ext.tls_mask);
        assert_eq!(again.got.slot_count(), ext.got.slot_count());
    }

    #[test]
    fn downgraded_mask_reports_local_exec() {
        let (mut state, id) = state_with_gd_symbol();
        downgrade_accesses(&mut state).unwrap();
        assert_eq!(
            gd_rewrite_for_mask(state.db.symbol(id).ext.tls_mask),
            GdRewrite::ToLocalExec
        );
    }
}
