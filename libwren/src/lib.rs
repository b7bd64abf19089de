//! PowerPC-32 backend of the wren linker. Takes the container layer's view
//! of the input objects, resolves symbol references, decides which of them
//! need GOT or PLT indirection, optimizes TLS access sequences, lays out the
//! dynamic-linking metadata and patches every relocation site, producing a
//! description of the output sections for the container writer.
//!
//! The pipeline runs fixed stages in a fixed order: scan, TLS optimization,
//! branch relaxation to a fixed point, dynamic-section sizing, stub
//! emission, relocation application, dynamic finalization. Every stage
//! reads and extends the same [`LinkState`].

pub mod args;
mod apply;
mod elf;
pub mod error;
pub mod input;
mod layout;
mod plan;
mod relax;
mod scan;
mod stubs;
mod symbol_db;
mod tls_opt;
mod value_flags;

pub use crate::args::Args;
pub use crate::args::CopyRelocations;
pub use crate::args::OutputKind;
pub use crate::error::Error;
pub use crate::error::Result;

use crate::error::Context;
use crate::input::InputObject;
use crate::input::SectionRef;
use crate::layout::OutputLayout;
use crate::plan::GotAllocator;
use crate::plan::PltScheme;
use crate::plan::PltSnapshot;
use crate::plan::TlsLdSlot;
use crate::symbol_db::DynRelocTable;
use crate::symbol_db::PltTable;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use hashbrown::HashMap;

/// Everything the pipeline stages share. One instance per link; dropped
/// wholesale at the end of the session.
pub(crate) struct LinkState {
    pub(crate) args: Args,
    pub(crate) db: SymbolDb,
    pub(crate) plt: PltTable,
    pub(crate) dyn_relocs: DynRelocTable,
    pub(crate) got: GotAllocator,
    pub(crate) tlsld: TlsLdSlot,
    pub(crate) plt_scheme: Option<PltScheme>,
    pub(crate) tls_opt_disabled: bool,
    pub(crate) has_static_tls: bool,
    pub(crate) saw_legacy_plt_call: bool,
    pub(crate) saw_secure_plt_evidence: bool,
    /// Sections observed to contain TLS relocations, for the optimizer.
    pub(crate) tls_sections: Vec<SectionRef>,
    pub(crate) layout: OutputLayout,
    pub(crate) glink_size: u32,
    pub(crate) plt_section_size: u32,
    pub(crate) dynbss_size: u32,
    pub(crate) reserved_rela_dyn: u32,
    pub(crate) reserved_rela_plt: u32,
    pub(crate) tls_get_addr_stub: bool,
    pub(crate) plt_snapshots: HashMap<SymbolId, PltSnapshot>,
    pub(crate) warnings: Vec<String>,
    pub(crate) stats: LinkStats,
}

impl LinkState {
    pub(crate) fn new(args: Args, db: SymbolDb) -> LinkState {
        LinkState {
            args,
            db,
            plt: PltTable::default(),
            dyn_relocs: DynRelocTable::default(),
            got: GotAllocator::default(),
            tlsld: TlsLdSlot::default(),
            plt_scheme: None,
            tls_opt_disabled: false,
            has_static_tls: false,
            saw_legacy_plt_call: false,
            saw_secure_plt_evidence: false,
            tls_sections: Vec::new(),
            layout: OutputLayout::default(),
            glink_size: 0,
            plt_section_size: 0,
            dynbss_size: 0,
            reserved_rela_dyn: 0,
            reserved_rela_plt: 0,
            tls_get_addr_stub: false,
            plt_snapshots: HashMap::new(),
            warnings: Vec::new(),
            stats: LinkStats::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub got_slots: u32,
    pub got_size: u32,
    pub plt_entries: u32,
    pub call_stubs: u32,
    pub trampolines: u32,
    pub prefetch_patches: u32,
    pub dynamic_relocations_reserved: u32,
    pub dynamic_relocations_written: u32,
    pub dynamic_symbols: u32,
}

/// Per-symbol accounting exposed for diagnostics and the driver's
/// `--sym-info`-style output.
#[derive(Clone, Debug)]
pub struct SymbolSummary {
    pub name: String,
    /// GOT words attributed to the symbol after optimization.
    pub got_slots: u32,
    pub plt_entries: u32,
    /// Total references the symbol's PLT entries had when their offsets
    /// were frozen.
    pub plt_references: u32,
    pub call_stubs: u32,
    /// Dynamic-relocation records that name this symbol.
    pub dynamic_relocations: u32,
}

#[derive(Debug)]
pub struct LinkOutput {
    pub layout: linker_layout::Layout,
    pub stats: LinkStats,
    pub warnings: Vec<String>,
    pub symbols: Vec<SymbolSummary>,
}

/// Runs the whole backend over already-enumerated input objects.
pub fn link(inputs: &[InputObject], args: Args) -> Result<LinkOutput> {
    let mut db = SymbolDb::build(inputs)?;
    for (alias, target) in &args.aliases {
        db.add_alias(alias, target)?;
    }
    let mut state = LinkState::new(args, db);

    scan::scan_inputs(&mut state, inputs).context("relocation scan failed")?;
    tls_opt::optimize(&mut state, inputs).context("TLS optimization failed")?;
    relax::run(&mut state, inputs).context("relaxation failed")?;
    plan::size_dynamic_sections(&mut state, inputs).context("dynamic layout failed")?;
    let stub_sections = stubs::emit(&mut state).context("stub emission failed")?;
    let applied = apply::apply_relocations(&mut state, inputs).context("relocation failed")?;
    finalise_dynamic(state, inputs, stub_sections, applied)
}

#[tracing::instrument(skip_all, name = "Finalise dynamic sections")]
fn finalise_dynamic(
    mut state: LinkState,
    inputs: &[InputObject],
    stub_sections: stubs::StubSections,
    applied: apply::ApplyOutput,
) -> Result<LinkOutput> {
    let reserved = state.reserved_rela_dyn + state.reserved_rela_plt;
    let written = state.stats.dynamic_relocations_written;
    crate::ensure!(
        reserved == written,
        "Internal error: reserved {reserved} dynamic relocation records but wrote {written}"
    );

    let dynamic = build_dynamic_table(&state, &applied);
    let symbols = symbol_summaries(&state, &applied);

    let mut sections = Vec::new();
    let mut patched: HashMap<SectionRef, Vec<u8>> = applied.sections.into_iter().collect();
    for (file, obj) in inputs.iter().enumerate() {
        for (sec_idx, sec) in obj.sections.iter().enumerate() {
            let section_ref = SectionRef::new(file, sec_idx);
            let placement = &state.layout.placements[file][sec_idx];
            let bytes = patched.remove(&section_ref).unwrap_or_default();
            sections.push(linker_layout::SectionImage {
                name: sec.name.clone(),
                address: u64::from(placement.address),
                alignment: u64::from(sec.alignment),
                mem_size: u64::from(sec.mem_size + placement.extra),
                bytes,
            });
        }
    }
    if state.glink_size > 0 {
        sections.push(linker_layout::SectionImage {
            name: ".glink".to_owned(),
            address: u64::from(state.layout.glink_address),
            alignment: 16,
            mem_size: u64::from(state.glink_size),
            bytes: stub_sections.glink,
        });
    }
    if state.got.size > 0 {
        sections.push(linker_layout::SectionImage {
            name: ".got".to_owned(),
            address: u64::from(state.layout.got_address),
            alignment: 4,
            mem_size: u64::from(state.got.size),
            bytes: applied.got,
        });
    }
    if state.plt_section_size > 0 {
        sections.push(linker_layout::SectionImage {
            name: ".plt".to_owned(),
            address: u64::from(state.layout.plt_address),
            alignment: 4,
            mem_size: u64::from(state.plt_section_size),
            bytes: stub_sections.plt,
        });
    }
    if state.dynbss_size > 0 {
        sections.push(linker_layout::SectionImage {
            name: ".dynbss".to_owned(),
            address: u64::from(state.layout.dynbss_address),
            alignment: 8,
            mem_size: u64::from(state.dynbss_size),
            bytes: Vec::new(),
        });
    }
    if !applied.rela_dyn.is_empty() {
        sections.push(linker_layout::SectionImage {
            name: ".rela.dyn".to_owned(),
            address: u64::from(state.layout.rela_dyn_address),
            alignment: 4,
            mem_size: (applied.rela_dyn.len() as u64) * u64::from(elf::RELA_ENTRY_SIZE),
            bytes: elf::rela_section_bytes(&applied.rela_dyn),
        });
    }
    if !applied.rela_plt.is_empty() {
        sections.push(linker_layout::SectionImage {
            name: ".rela.plt".to_owned(),
            address: u64::from(state.layout.rela_plt_address),
            alignment: 4,
            mem_size: (applied.rela_plt.len() as u64) * u64::from(elf::RELA_ENTRY_SIZE),
            bytes: elf::rela_section_bytes(&applied.rela_plt),
        });
    }

    let dynamic_symbols = dynamic_symbol_names(&state);
    let stats = state.stats;
    let warnings = state.warnings;

    Ok(LinkOutput {
        layout: linker_layout::Layout {
            sections,
            dynamic,
            dynamic_symbols,
        },
        stats,
        warnings,
        symbols,
    })
}

fn build_dynamic_table(
    state: &LinkState,
    applied: &apply::ApplyOutput,
) -> Vec<linker_layout::DynamicEntry> {
    let mut dynamic = Vec::new();
    if !state.args.output_kind.needs_dynamic() {
        return dynamic;
    }
    let mut push = |tag: u32, value: u32| {
        dynamic.push(linker_layout::DynamicEntry { tag, value });
    };

    if !applied.rela_dyn.is_empty() {
        push(object::elf::DT_RELA, state.layout.rela_dyn_address);
        push(
            object::elf::DT_RELASZ,
            applied.rela_dyn.len() as u32 * elf::RELA_ENTRY_SIZE,
        );
        push(object::elf::DT_RELAENT, elf::RELA_ENTRY_SIZE);
    }
    if state.plt_section_size > 0 {
        push(object::elf::DT_PLTGOT, state.layout.plt_address);
        push(
            object::elf::DT_PLTRELSZ,
            applied.rela_plt.len() as u32 * elf::RELA_ENTRY_SIZE,
        );
        push(object::elf::DT_PLTREL, object::elf::DT_RELA);
        push(object::elf::DT_JMPREL, state.layout.rela_plt_address);
    }
    if state.plt_scheme == Some(PltScheme::Secure) && state.got.size > 0 {
        push(
            object::elf::DT_PPC_GOT,
            state.layout.got_address + state.got.base_offset(),
        );
    }
    if applied.has_text_relocs {
        push(object::elf::DT_TEXTREL, 0);
    }
    if state.has_static_tls && state.args.output_kind.is_shared_object() {
        push(object::elf::DT_FLAGS, object::elf::DF_STATIC_TLS);
    }
    dynamic
}

fn dynamic_symbol_names(state: &LinkState) -> Vec<String> {
    let mut named: Vec<(u32, String)> = state
        .db
        .symbol_ids()
        .filter_map(|id| {
            let sym = state.db.symbol(id);
            sym.ext
                .dynamic_symbol_index
                .map(|index| (index.get(), sym.name.clone()))
        })
        .collect();
    named.sort_by_key(|(index, _)| *index);
    named.into_iter().map(|(_, name)| name).collect()
}

fn symbol_summaries(state: &LinkState, applied: &apply::ApplyOutput) -> Vec<SymbolSummary> {
    state
        .db
        .symbol_ids()
        .map(|id| {
            let sym = state.db.symbol(id);
            let snapshot = state.plt_snapshots.get(&id).copied().unwrap_or_default();
            let dynamic_relocations = match sym.ext.dynamic_symbol_index {
                Some(index) => applied
                    .rela_dyn
                    .iter()
                    .chain(&applied.rela_plt)
                    .filter(|rela| {
                        rela.r_info.get(object::BigEndian) >> 8 == index.get()
                    })
                    .count() as u32,
                None => 0,
            };
            SymbolSummary {
                name: sym.name.clone(),
                got_slots: sym.ext.got.slot_count(),
                plt_entries: snapshot.entries,
                plt_references: snapshot.references,
                call_stubs: snapshot.stubs,
                dynamic_relocations,
            }
        })
        .collect()
}
