//! Assigns output addresses to every allocatable section. Executable
//! sections come first so that branch displacements between them are
//! unaffected by the later, still-changing sizes of the linker-created
//! sections; the relaxation loop depends on that stability.

use crate::LinkState;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::SectionRef;
use crate::input::SymbolPlacement;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolDefinition;
use crate::symbol_db::SymbolRef;

#[derive(Default)]
pub(crate) struct OutputLayout {
    /// Placement of every input section, `[file][section]`.
    pub(crate) placements: Vec<Vec<SectionPlacement>>,
    pub(crate) glink_address: u32,
    pub(crate) got_address: u32,
    pub(crate) plt_address: u32,
    pub(crate) dynbss_address: u32,
    pub(crate) rela_dyn_address: u32,
    pub(crate) rela_plt_address: u32,
    /// Value of the small-data base symbol, once `.sdata`/`.sbss` have been
    /// placed.
    pub(crate) sda_base: Option<u32>,
    pub(crate) tls_start: Option<u32>,
    pub(crate) end_address: u32,
}

/// Where one input section landed, plus the relaxation state that grows its
/// tail. The growth survives re-layout; only addresses are recomputed.
#[derive(Clone, Debug, Default)]
pub(crate) struct SectionPlacement {
    pub(crate) address: u32,
    pub(crate) included: bool,
    pub(crate) trampolines: Vec<Trampoline>,
    pub(crate) moved: Vec<MovedInsn>,
    /// Bytes appended past the input data for trampolines and erratum
    /// patches.
    pub(crate) extra: u32,
}

/// A long-branch island appended to its section. Keyed by the branch target
/// so each out-of-range destination gets exactly one island per section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Trampoline {
    pub(crate) target: BranchTarget,
    /// Offset of the island from the start of the section's data.
    pub(crate) offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BranchTarget {
    pub(crate) symbol: SymbolRef,
    pub(crate) addend: i32,
}

/// An instruction relocated out of the last word of a page by the prefetch
/// workaround. The patch site holds the moved instruction followed by a
/// branch back to the word after the original slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MovedInsn {
    pub(crate) orig_offset: u32,
    pub(crate) patch_offset: u32,
}

impl SectionPlacement {
    pub(crate) fn trampoline_for(&self, target: BranchTarget) -> Option<&Trampoline> {
        self.trampolines.iter().find(|t| t.target == target)
    }

    pub(crate) fn moved_to(&self, orig_offset: u32) -> Option<u32> {
        self.moved
            .iter()
            .find(|m| m.orig_offset == orig_offset)
            .map(|m| m.patch_offset)
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.next_multiple_of(alignment.max(1))
}

/// Section placement order. TLS data goes between the ordinary read-only and
/// writable regions so that the TLS image is contiguous.
fn placement_pass(inputs: &[InputObject], file: usize, section: usize) -> Option<u32> {
    let sec = &inputs[file].sections[section];
    if !sec.is_alloc() {
        return None;
    }
    Some(if sec.is_executable() {
        0
    } else if sec.is_tls() {
        if sec.is_bss { 3 } else { 2 }
    } else if sec.name == ".sdata" || sec.name == ".sbss" {
        6
    } else if !sec.is_writable() {
        1
    } else if sec.is_bss {
        5
    } else {
        4
    })
}

/// Recomputes every address from the current section sizes. Called once per
/// relaxation iteration and once more after the dynamic sections have been
/// sized.
pub(crate) fn assign_addresses(state: &mut LinkState, inputs: &[InputObject]) {
    if state.layout.placements.is_empty() {
        state.layout.placements = inputs
            .iter()
            .map(|obj| vec![SectionPlacement::default(); obj.sections.len()])
            .collect();
    }

    let mut address = state.args.base_address;
    let mut tls_start = None;

    for pass in 0..=6u32 {
        for (file, obj) in inputs.iter().enumerate() {
            for section in 0..obj.sections.len() {
                if placement_pass(inputs, file, section) != Some(pass) {
                    continue;
                }
                let sec = &obj.sections[section];
                address = align_up(address, sec.alignment);
                let placement = &mut state.layout.placements[file][section];
                placement.address = address;
                placement.included = true;
                if sec.is_tls() && tls_start.is_none() {
                    tls_start = Some(address);
                }
                address += sec.mem_size + placement.extra;
            }
        }
        if pass == 0 {
            // The stub section sits directly after the code it serves.
            address = align_up(address, 16);
            state.layout.glink_address = address;
            address += state.glink_size;
        }
    }

    address = align_up(address, 4);
    state.layout.got_address = address;
    address += state.got.size;

    address = align_up(address, 4);
    state.layout.plt_address = address;
    address += state.plt_section_size;

    let sdata_address = state
        .layout
        .placements
        .iter()
        .enumerate()
        .flat_map(|(file, placements)| {
            placements.iter().enumerate().filter_map(move |(i, p)| {
                (p.included && inputs[file].sections[i].name == ".sdata").then_some(p.address)
            })
        })
        .min();
    state.layout.sda_base = sdata_address.map(|a| a + crate::elf::SDA_BASE_OFFSET);

    address = align_up(address, 4);
    state.layout.dynbss_address = address;
    address += state.dynbss_size;

    address = align_up(address, 4);
    state.layout.rela_dyn_address = address;
    address += state.reserved_rela_dyn * crate::elf::RELA_ENTRY_SIZE;

    state.layout.rela_plt_address = address;
    address += state.reserved_rela_plt * crate::elf::RELA_ENTRY_SIZE;

    state.layout.tls_start = tls_start;
    state.layout.end_address = address;
}

/// What a symbol reference resolves to before any GOT/PLT indirection is
/// taken into account.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SymbolValue {
    Address(u32),
    Absolute(u32),
    Undefined { weak: bool },
}

impl SymbolValue {
    /// The raw value used in relocation arithmetic. Undefined symbols
    /// contribute zero.
    pub(crate) fn value(self) -> u32 {
        match self {
            SymbolValue::Address(v) | SymbolValue::Absolute(v) => v,
            SymbolValue::Undefined { .. } => 0,
        }
    }

    pub(crate) fn is_undefined(self) -> bool {
        matches!(self, SymbolValue::Undefined { .. })
    }
}

pub(crate) fn resolve_symbol_value(
    db: &SymbolDb,
    layout: &OutputLayout,
    inputs: &[InputObject],
    symbol: SymbolRef,
) -> Result<SymbolValue> {
    match symbol {
        SymbolRef::Local { file, sym } => {
            let input_sym = &inputs[file as usize].symbols[sym as usize];
            Ok(match input_sym.placement {
                SymbolPlacement::Section(section) => {
                    let placement = &layout.placements[file as usize][section];
                    SymbolValue::Address(placement.address + input_sym.value)
                }
                SymbolPlacement::Absolute => SymbolValue::Absolute(input_sym.value),
                SymbolPlacement::Undefined => SymbolValue::Undefined { weak: false },
            })
        }
        SymbolRef::Global(id) => {
            let id = db.resolved(id)?;
            Ok(match &db.symbol(id).def {
                SymbolDefinition::Undefined { weak } => SymbolValue::Undefined { weak: *weak },
                SymbolDefinition::Defined(def) => match def.section {
                    Some(section) => {
                        let placement = &layout.placements[def.file as usize][section as usize];
                        SymbolValue::Address(placement.address + def.value)
                    }
                    None => SymbolValue::Absolute(def.value),
                },
                SymbolDefinition::Indirect(_) => unreachable!("resolved above"),
            })
        }
    }
}

/// The input section a symbol is defined in, if any.
pub(crate) fn symbol_section(
    db: &SymbolDb,
    inputs: &[InputObject],
    symbol: SymbolRef,
) -> Result<Option<SectionRef>> {
    match symbol {
        SymbolRef::Local { file, sym } => {
            Ok(match inputs[file as usize].symbols[sym as usize].placement {
                SymbolPlacement::Section(section) => Some(SectionRef::new(file as usize, section)),
                _ => None,
            })
        }
        SymbolRef::Global(id) => {
            let id = db.resolved(id)?;
            Ok(match &db.symbol(id).def {
                SymbolDefinition::Defined(def) => def
                    .section
                    .map(|s| SectionRef::new(def.file as usize, s as usize)),
                _ => None,
            })
        }
    }
}
