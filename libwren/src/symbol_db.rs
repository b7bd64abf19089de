//! Global symbol resolution and the per-symbol bookkeeping that the pipeline
//! stages accumulate: GOT reference counts, PLT entry chains, TLS access
//! masks and dynamic-relocation demand.

use crate::args::Args;
use crate::bail;
use crate::ensure;
use crate::error::Result;
use crate::input::InputObject;
use crate::input::SectionRef;
use crate::input::SymbolBinding;
use crate::input::SymbolKind;
use crate::input::SymbolPlacement;
use crate::input::Visibility;
use crate::value_flags::ValueFlags;
use hashbrown::HashMap;
use linker_utils::ppc32::TlsMask;
use smallvec::SmallVec;
use std::num::NonZeroU32;

/// Index of a global symbol in the link-wide table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Index of a PLT entry in the per-link arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PltId(u32);

/// A reference to either a global symbol or a local symbol of one input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum SymbolRef {
    Global(SymbolId),
    Local { file: u32, sym: u32 },
}

#[derive(Clone, Debug)]
pub(crate) enum SymbolDefinition {
    Undefined {
        weak: bool,
    },
    Defined(Definition),
    /// An alias installed by the driver (e.g. from a version script),
    /// resolved by iterating with a depth guard rather than chasing links
    /// unboundedly.
    Indirect(SymbolId),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Definition {
    pub(crate) file: u32,
    /// `None` for absolute symbols.
    pub(crate) section: Option<u32>,
    pub(crate) value: u32,
    pub(crate) size: u32,
    pub(crate) kind: SymbolKind,
    pub(crate) weak: bool,
}

/// References per distinct GOT access kind. Slot demand is derived from
/// which kinds are present, not from the raw counts; the counts let the TLS
/// optimizer tell when an access kind has fully disappeared.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct GotCounts {
    pub(crate) addr: u32,
    pub(crate) tlsgd: u32,
    pub(crate) tprel: u32,
    pub(crate) dtprel: u32,
}

impl GotCounts {
    /// Number of GOT words this symbol needs: a module-id/offset pair for
    /// general-dynamic, one word for each other active kind.
    pub(crate) fn slot_count(&self) -> u32 {
        let mut slots = 0;
        if self.addr > 0 {
            slots += 1;
        }
        if self.tlsgd > 0 {
            slots += 2;
        }
        if self.tprel > 0 {
            slots += 1;
        }
        if self.dtprel > 0 {
            slots += 1;
        }
        slots
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct GotOffsets {
    pub(crate) addr: Option<u32>,
    pub(crate) tlsgd: Option<u32>,
    pub(crate) tprel: Option<u32>,
    pub(crate) dtprel: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SymbolExtension {
    pub(crate) flags: ValueFlags,
    pub(crate) got: GotCounts,
    pub(crate) got_offsets: GotOffsets,
    /// Entries in the PLT arena belonging to this symbol. PIC callers
    /// address the PLT through per-caller GOT pointers, so one symbol can
    /// own several entries distinguished by their key.
    pub(crate) plt: SmallVec<[PltId; 1]>,
    pub(crate) tls_mask: TlsMask,
    /// Call sites counted per model so the optimizer knows how many resolver
    /// calls disappear when accesses degrade.
    pub(crate) gd_call_sites: u32,
    pub(crate) ld_call_sites: u32,
    pub(crate) has_sda_ref: bool,
    pub(crate) has_high_ref: bool,
    pub(crate) has_low_ref: bool,
    /// Offset in the copy-relocation area once assigned.
    pub(crate) copy_offset: Option<u32>,
    /// Largest size any undefined reference declared for the symbol; used to
    /// size a copy-relocation shadow when no definition is visible.
    pub(crate) copy_size_hint: u32,
    pub(crate) dynamic_symbol_index: Option<NonZeroU32>,
}

/// Per-local-symbol bookkeeping, one array per input object. Locals never
/// get copy relocations or dynamic symbol entries, so this is a reduced form
/// of [`SymbolExtension`].
#[derive(Clone, Debug, Default)]
pub(crate) struct LocalSymbolExtension {
    pub(crate) got: GotCounts,
    pub(crate) got_offsets: GotOffsets,
    /// Only ever populated for local ifunc symbols.
    pub(crate) plt: SmallVec<[PltId; 1]>,
    pub(crate) tls_mask: TlsMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PltKey {
    /// The caller's auxiliary GOT-pointer section for PIC calls, `None` for
    /// calls that use the ordinary convention.
    pub(crate) got2: Option<SectionRef>,
    pub(crate) addend: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum PltState {
    Pending { refcount: u32 },
    Assigned { offset: u32 },
}

#[derive(Clone, Debug)]
pub(crate) struct PltEntry {
    pub(crate) key: PltKey,
    pub(crate) state: PltState,
    pub(crate) stub_offset: Option<u32>,
}

impl PltEntry {
    pub(crate) fn refcount(&self) -> u32 {
        match self.state {
            PltState::Pending { refcount } => refcount,
            PltState::Assigned { .. } => 0,
        }
    }

    pub(crate) fn offset(&self) -> Option<u32> {
        match self.state {
            PltState::Assigned { offset } => Some(offset),
            PltState::Pending { .. } => None,
        }
    }

    fn add_ref(&mut self) -> Result {
        match &mut self.state {
            PltState::Pending { refcount } => {
                *refcount += 1;
                Ok(())
            }
            PltState::Assigned { .. } => {
                bail!("Internal error: PLT refcount changed after offset assignment")
            }
        }
    }

    pub(crate) fn sub_ref(&mut self) -> Result {
        match &mut self.state {
            PltState::Pending { refcount } => {
                ensure!(
                    *refcount > 0,
                    "Internal error: PLT refcount underflow"
                );
                *refcount -= 1;
                Ok(())
            }
            PltState::Assigned { .. } => {
                bail!("Internal error: PLT refcount changed after offset assignment")
            }
        }
    }
}

/// Arena of all PLT entries of the link. Symbols refer to their entries by
/// index; everything is dropped together at the end of the session.
#[derive(Default)]
pub(crate) struct PltTable {
    pub(crate) entries: Vec<PltEntry>,
}

impl PltTable {
    /// Finds the entry with `key` on `chain`, creating it if absent, and
    /// counts one more reference to it.
    pub(crate) fn reference(
        &mut self,
        chain: &mut SmallVec<[PltId; 1]>,
        key: PltKey,
    ) -> Result<PltId> {
        if let Some(&id) = chain
            .iter()
            .find(|&&PltId(i)| self.entries[i as usize].key == key)
        {
            self.entries[id.0 as usize].add_ref()?;
            return Ok(id);
        }
        let id = PltId(self.entries.len() as u32);
        self.entries.push(PltEntry {
            key,
            state: PltState::Pending { refcount: 1 },
            stub_offset: None,
        });
        chain.push(id);
        Ok(id)
    }

    pub(crate) fn entry(&self, id: PltId) -> &PltEntry {
        &self.entries[id.0 as usize]
    }

    pub(crate) fn entry_mut(&mut self, id: PltId) -> &mut PltEntry {
        &mut self.entries[id.0 as usize]
    }
}

pub(crate) struct GlobalSymbol {
    pub(crate) name: String,
    pub(crate) def: SymbolDefinition,
    pub(crate) visibility: Visibility,
    pub(crate) ext: SymbolExtension,
}

pub(crate) struct SymbolDb {
    symbols: Vec<GlobalSymbol>,
    names: HashMap<String, SymbolId>,
    /// Maps each object's global symbol-table indices to link-wide ids.
    per_object_ids: Vec<Vec<SymbolId>>,
    /// Per-object local symbol extensions, indexed by symbol-table index.
    pub(crate) locals: Vec<Vec<LocalSymbolExtension>>,
    pub(crate) tls_get_addr: Option<SymbolId>,
}

/// Alias chains longer than this are treated as cycles.
const MAX_ALIAS_DEPTH: usize = 32;

impl SymbolDb {
    #[tracing::instrument(skip_all, name = "Build symbol DB")]
    pub(crate) fn build(inputs: &[InputObject]) -> Result<SymbolDb> {
        let mut db = SymbolDb {
            symbols: Vec::new(),
            names: HashMap::new(),
            per_object_ids: Vec::with_capacity(inputs.len()),
            locals: inputs
                .iter()
                .map(|obj| vec![LocalSymbolExtension::default(); obj.num_local_symbols])
                .collect(),
            tls_get_addr: None,
        };

        for (file_idx, obj) in inputs.iter().enumerate() {
            let mut ids = Vec::with_capacity(obj.symbols.len() - obj.num_local_symbols);
            for sym in &obj.symbols[obj.num_local_symbols..] {
                ensure!(
                    sym.binding != SymbolBinding::Local,
                    "{}: local symbol {} listed among globals",
                    obj.name,
                    sym.name
                );
                let id = db.intern(&sym.name);
                match sym.placement {
                    SymbolPlacement::Undefined => {
                        // An undefined reference never overrides a
                        // definition; it only strengthens the undefined
                        // state and contributes its declared size.
                        let entry = &mut db.symbols[id.as_usize()];
                        if let SymbolDefinition::Undefined { weak } = &mut entry.def {
                            *weak = *weak && sym.binding == SymbolBinding::Weak;
                        }
                        merge_visibility(&mut entry.visibility, sym.visibility);
                        entry.ext.copy_size_hint = entry.ext.copy_size_hint.max(sym.size);
                    }
                    SymbolPlacement::Section(_) | SymbolPlacement::Absolute => {
                        let definition = Definition {
                            file: file_idx as u32,
                            section: match sym.placement {
                                SymbolPlacement::Section(s) => Some(s as u32),
                                _ => None,
                            },
                            value: sym.value,
                            size: sym.size,
                            kind: sym.kind,
                            weak: sym.binding == SymbolBinding::Weak,
                        };
                        db.define(id, definition, sym.visibility, &obj.name)?;
                    }
                }
                ids.push(id);
            }
            db.per_object_ids.push(ids);
        }

        // Seed the flags the scanner's classification depends on.
        for symbol in &mut db.symbols {
            if let SymbolDefinition::Defined(def) = &symbol.def {
                match def.kind {
                    SymbolKind::Function => symbol.ext.flags |= crate::value_flags::ValueFlags::FUNCTION,
                    SymbolKind::IndirectFunction => {
                        symbol.ext.flags |= crate::value_flags::ValueFlags::FUNCTION
                            | crate::value_flags::ValueFlags::IFUNC;
                    }
                    _ => {}
                }
                if def.section.is_none() {
                    symbol.ext.flags |= crate::value_flags::ValueFlags::ABSOLUTE;
                }
            }
        }

        db.tls_get_addr = db.lookup("__tls_get_addr");
        Ok(db)
    }

    fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(GlobalSymbol {
            name: name.to_owned(),
            def: SymbolDefinition::Undefined { weak: true },
            visibility: Visibility::Default,
            ext: SymbolExtension::default(),
        });
        self.names.insert(name.to_owned(), id);
        id
    }

    fn define(
        &mut self,
        id: SymbolId,
        definition: Definition,
        visibility: Visibility,
        object_name: &str,
    ) -> Result {
        let entry = &mut self.symbols[id.as_usize()];
        merge_visibility(&mut entry.visibility, visibility);
        match &entry.def {
            SymbolDefinition::Undefined { .. } => {
                entry.def = SymbolDefinition::Defined(definition);
            }
            SymbolDefinition::Defined(existing) => {
                if existing.weak && !definition.weak {
                    entry.def = SymbolDefinition::Defined(definition);
                } else if !existing.weak && !definition.weak {
                    bail!(
                        "Duplicate strong definition of `{}` in {object_name}",
                        entry.name
                    );
                }
                // A weak definition never displaces an existing one.
            }
            SymbolDefinition::Indirect(_) => {
                bail!(
                    "Cannot define `{}`: it is an alias of another symbol",
                    entry.name
                );
            }
        }
        Ok(())
    }

    /// Installs `alias` as an indirect symbol pointing at `target`.
    pub(crate) fn add_alias(&mut self, alias: &str, target: &str) -> Result {
        let target_id = self.intern(target);
        let alias_id = self.intern(alias);
        let entry = &mut self.symbols[alias_id.as_usize()];
        match entry.def {
            SymbolDefinition::Undefined { .. } => {
                entry.def = SymbolDefinition::Indirect(target_id);
                Ok(())
            }
            _ => bail!("Cannot alias already-defined symbol `{alias}`"),
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    /// Follows alias links to the symbol that actually carries the
    /// definition state.
    pub(crate) fn resolved(&self, mut id: SymbolId) -> Result<SymbolId> {
        for _ in 0..MAX_ALIAS_DEPTH {
            match self.symbols[id.as_usize()].def {
                SymbolDefinition::Indirect(target) => id = target,
                _ => return Ok(id),
            }
        }
        bail!(
            "Alias cycle while resolving symbol `{}`",
            self.symbols[id.as_usize()].name
        )
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &GlobalSymbol {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut GlobalSymbol {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn name(&self, id: SymbolId) -> &str {
        &self.symbols[id.as_usize()].name
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    /// Maps a relocation's symbol-table index to a link-wide reference.
    pub(crate) fn resolve_ref(&self, file: usize, sym_index: u32, num_locals: usize) -> SymbolRef {
        if (sym_index as usize) < num_locals {
            SymbolRef::Local {
                file: file as u32,
                sym: sym_index,
            }
        } else {
            SymbolRef::Global(self.per_object_ids[file][sym_index as usize - num_locals])
        }
    }

    pub(crate) fn local_ext(&self, file: u32, sym: u32) -> &LocalSymbolExtension {
        &self.locals[file as usize][sym as usize]
    }

    pub(crate) fn local_ext_mut(&mut self, file: u32, sym: u32) -> &mut LocalSymbolExtension {
        &mut self.locals[file as usize][sym as usize]
    }

    /// Whether the symbol's value can be replaced by another module at load
    /// time, in which case link-time references cannot bind to our
    /// definition.
    pub(crate) fn is_interposable(&self, id: SymbolId, args: &Args) -> Result<bool> {
        let id = self.resolved(id)?;
        let sym = self.symbol(id);
        Ok(match &sym.def {
            SymbolDefinition::Undefined { .. } => args.output_kind.needs_dynamic(),
            SymbolDefinition::Defined(_) => {
                args.output_kind.is_shared_object()
                    && !args.bind_symbolically
                    && sym.visibility == Visibility::Default
            }
            SymbolDefinition::Indirect(_) => unreachable!("resolved above"),
        })
    }

    pub(crate) fn is_undefined(&self, id: SymbolId) -> Result<bool> {
        let id = self.resolved(id)?;
        Ok(matches!(
            self.symbol(id).def,
            SymbolDefinition::Undefined { .. }
        ))
    }

    pub(crate) fn is_undefined_weak(&self, id: SymbolId) -> Result<bool> {
        let id = self.resolved(id)?;
        Ok(matches!(
            self.symbol(id).def,
            SymbolDefinition::Undefined { weak: true }
        ))
    }
}

/// Dynamic-relocation demand accumulated per (owner symbol, input section).
/// The totals reserved here must exactly match the records later written by
/// the applier; a mismatch is an internal consistency failure.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DynRelocCounts {
    pub(crate) count: u32,
    pub(crate) pc_rel: u32,
    pub(crate) ifunc: bool,
}

#[derive(Default)]
pub(crate) struct DynRelocTable {
    records: HashMap<(SymbolRef, SectionRef), DynRelocCounts>,
}

impl DynRelocTable {
    pub(crate) fn add(&mut self, owner: SymbolRef, section: SectionRef, pc_rel: bool, ifunc: bool) {
        let counts = self.records.entry((owner, section)).or_default();
        counts.count += 1;
        if pc_rel {
            counts.pc_rel += 1;
        }
        counts.ifunc |= ifunc;
    }

    /// Total records reserved for input-section relocations.
    pub(crate) fn total(&self) -> u32 {
        self.records.values().map(|c| c.count).sum()
    }

    pub(crate) fn total_for_symbol(&self, id: SymbolId) -> u32 {
        self.records
            .iter()
            .filter(|((owner, _), _)| *owner == SymbolRef::Global(id))
            .map(|(_, c)| c.count)
            .sum()
    }

    /// Drops all records owned by `id` because the planner found a way to
    /// resolve its references without runtime fix-ups. Returns how many
    /// records were removed.
    pub(crate) fn remove_for_symbol(&mut self, id: SymbolId) -> u32 {
        let mut removed = 0;
        self.records.retain(|(owner, _), counts| {
            if *owner == SymbolRef::Global(id) {
                removed += counts.count;
                false
            } else {
                true
            }
        });
        removed
    }
}

/// Keeps the most restrictive visibility seen across all references and
/// definitions of a symbol.
fn merge_visibility(current: &mut Visibility, new: Visibility) {
    let rank = |v: Visibility| match v {
        Visibility::Default => 0,
        Visibility::Protected => 1,
        Visibility::Hidden => 2,
        Visibility::Internal => 3,
    };
    if rank(new) > rank(*current) {
        *current = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputSymbol;

    fn defined(name: &str, weak: bool) -> InputSymbol {
        InputSymbol {
            name: name.to_owned(),
            value: 0x10,
            size: 4,
            placement: SymbolPlacement::Section(0),
            binding: if weak {
                SymbolBinding::Weak
            } else {
                SymbolBinding::Global
            },
            kind: SymbolKind::Function,
            visibility: Visibility::Default,
        }
    }

    #[test]
    fn strong_definition_wins_over_weak() {
        let mut a = InputObject::new("a.o");
        a.add_symbol(defined("f", true));
        let mut b = InputObject::new("b.o");
        b.add_symbol(defined("f", false));
        let db = SymbolDb::build(&[a, b]).unwrap();
        let id = db.lookup("f").unwrap();
        match &db.symbol(id).def {
            SymbolDefinition::Defined(d) => assert_eq!(d.file, 1),
            other => panic!("expected definition, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_strong_definitions_rejected() {
        let mut a = InputObject::new("a.o");
        a.add_symbol(defined("f", false));
        let mut b = InputObject::new("b.o");
        b.add_symbol(defined("f", false));
        assert!(SymbolDb::build(&[a, b]).is_err());
    }

    #[test]
    fn alias_cycle_detected() {
        let db_inputs = [InputObject::new("a.o")];
        let mut db = SymbolDb::build(&db_inputs).unwrap();
        db.add_alias("x", "y").unwrap();
        db.add_alias("y", "x").unwrap();
        let x = db.lookup("x").unwrap();
        assert!(db.resolved(x).is_err());
    }

    #[test]
    fn plt_refcount_frozen_once_assigned() {
        let mut table = PltTable::default();
        let mut chain = SmallVec::new();
        let key = PltKey {
            got2: None,
            addend: 0,
        };
        let id = table.reference(&mut chain, key).unwrap();
        table.reference(&mut chain, key).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(table.entry(id).refcount(), 2);
        table.entry_mut(id).state = PltState::Assigned { offset: 0 };
        assert!(table.entry_mut(id).sub_ref().is_err());
    }
}
