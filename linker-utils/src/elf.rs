//! Format-level types shared between the backend and its architecture tables:
//! section flags, generic relocation codes, relocation descriptors and the
//! bitfield insert/extract machinery they drive.

use std::fmt::Display;

/// Section header flags. A thin wrapper so that flag constants can be combined
/// and tested without going through raw `u64`s everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct SectionFlags(u64);

impl SectionFlags {
    pub const fn from_u64(raw: u64) -> SectionFlags {
        SectionFlags(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: SectionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for SectionFlags {
    type Output = SectionFlags;

    fn bitor(self, rhs: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | rhs.0)
    }
}

/// `SHF_*` constants as `SectionFlags` values.
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_WRITE as u64);
    pub const ALLOC: SectionFlags = SectionFlags::from_u64(object::elf::SHF_ALLOC as u64);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u64(object::elf::SHF_EXECINSTR as u64);
    pub const TLS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_TLS as u64);
}

/// Names of the sections the linker itself creates or treats specially.
pub mod secnames {
    pub const GOT: &str = ".got";
    pub const GOT2: &str = ".got2";
    pub const PLT: &str = ".plt";
    pub const GLINK: &str = ".glink";
    pub const RELA_DYN: &str = ".rela.dyn";
    pub const RELA_PLT: &str = ".rela.plt";
    pub const DYNBSS: &str = ".dynbss";
    pub const SDATA: &str = ".sdata";
    pub const SBSS: &str = ".sbss";
}

/// Architecture-neutral classification of a relocation. The scanner and
/// applier dispatch on this rather than on raw type numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationKind {
    None,
    /// Absolute address of the symbol, stored in a data word or instruction
    /// immediate.
    Absolute,
    /// Address of the symbol relative to the place being relocated.
    Relative,
    /// Absolute branch target field.
    Branch,
    /// PC-relative branch displacement field.
    BranchRelative,
    /// Offset of the symbol's GOT slot from the GOT base pointer.
    Got,
    /// PC-relative branch that must be routed through the PLT when the target
    /// is not directly reachable.
    PltBranch,
    /// Address of (or displacement to) the symbol's PLT slot.
    PltAddr,
    /// Offset from the small-data base.
    SdaRelative,
    /// Small-data reference that also patches the base register field of the
    /// containing instruction.
    SdaBased21,
    /// Offset of the symbol from the start of its output section.
    SectionOffset,
    /// Offset of a general-dynamic TLS descriptor pair in the GOT.
    GotTlsGd,
    /// Offset of the local-dynamic module-id pair in the GOT.
    GotTlsLd,
    /// Offset of a thread-pointer-relative GOT slot.
    GotTpRel,
    /// Offset of a dynamic-thread-vector-relative GOT slot.
    GotDtpRel,
    /// Thread-pointer-relative value of the symbol.
    TpRel,
    /// Dynamic-thread-vector-relative value of the symbol.
    DtpRel,
    /// Marker on the `add` instruction of an initial-exec sequence.
    TlsMark,
    /// Marker on the `__tls_get_addr` call of a general-dynamic sequence.
    TlsGdMark,
    /// Marker on the `__tls_get_addr` call of a local-dynamic sequence.
    TlsLdMark,
    /// TLS module id. Only ever emitted as a dynamic relocation.
    DtpMod,
    Copy,
    GlobDat,
    JumpSlot,
    Irelative,
}

impl RelocationKind {
    #[must_use]
    pub fn is_tls(self) -> bool {
        matches!(
            self,
            RelocationKind::GotTlsGd
                | RelocationKind::GotTlsLd
                | RelocationKind::GotTpRel
                | RelocationKind::GotDtpRel
                | RelocationKind::TpRel
                | RelocationKind::DtpRel
                | RelocationKind::TlsMark
                | RelocationKind::TlsGdMark
                | RelocationKind::TlsLdMark
                | RelocationKind::DtpMod
        )
    }

    /// True for the branch-displacement field kinds. Overflow diagnostics for
    /// these are suppressed when the target is undefined, since a call guarded
    /// by a null check is never taken.
    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            RelocationKind::Branch | RelocationKind::BranchRelative | RelocationKind::PltBranch
        )
    }
}

/// The relocations we emit for the runtime loader to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DynamicRelocationKind {
    /// Load address plus a constant; no symbol.
    Relative,
    /// Resolved symbol address.
    Symbolic,
    /// Resolver-function result for an ifunc symbol.
    Irelative,
    /// TLS module id of the defining module.
    ModuleId,
    /// Offset of the symbol within its module's TLS block.
    ModuleOffset,
    /// Thread-pointer-relative offset of the symbol.
    TpOffset,
    /// Load-time copy of the symbol's initial value.
    Copy,
    /// Lazily resolved PLT slot.
    JumpSlot,
}

impl DynamicRelocationKind {
    #[must_use]
    pub fn ppc32_r_type(self) -> u32 {
        match self {
            DynamicRelocationKind::Relative => object::elf::R_PPC_RELATIVE,
            DynamicRelocationKind::Symbolic => object::elf::R_PPC_GLOB_DAT,
            DynamicRelocationKind::Irelative => object::elf::R_PPC_IRELATIVE,
            DynamicRelocationKind::ModuleId => object::elf::R_PPC_DTPMOD32,
            DynamicRelocationKind::ModuleOffset => object::elf::R_PPC_DTPREL32,
            DynamicRelocationKind::TpOffset => object::elf::R_PPC_TPREL32,
            DynamicRelocationKind::Copy => object::elf::R_PPC_COPY,
            DynamicRelocationKind::JumpSlot => object::elf::R_PPC_JMP_SLOT,
        }
    }
}

/// What to do when a computed value doesn't fit the destination field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Truncate silently. Used for fields that are halves of a larger value.
    Ignore,
    /// The value must fit the field as a signed quantity.
    Signed,
    /// The value must fit the field as either a signed or an unsigned
    /// quantity.
    Bitfield,
}

/// Out-of-band treatment a descriptor requests from the applier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RelocationSpecial {
    #[default]
    None,
    /// High half compensating for sign-extension of the paired low half: the
    /// stored value is `(value + 0x8000) >> 16`.
    HighAdjust,
    /// Never valid in relocatable input; only ever written by the linker into
    /// dynamic relocation sections.
    ForceDynamic,
}

/// Returned when a value doesn't satisfy a descriptor's overflow policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldOverflow {
    pub value: i64,
    pub bit_width: u32,
}

impl Display for FieldOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "value 0x{:x} does not fit in a {}-bit field",
            self.value, self.bit_width
        )
    }
}

/// Static description of one relocation type: how its field is packed and
/// checked. Built once per type in the architecture table.
#[derive(Clone, Copy, Debug)]
pub struct RelocationKindInfo {
    pub kind: RelocationKind,
    /// Bytes the relocated field occupies in the section: 2 or 4.
    pub byte_size: usize,
    /// Number of significant bits checked by the overflow policy.
    pub bit_width: u32,
    /// Shift applied to the computed value before insertion.
    pub right_shift: u32,
    /// Left shift of the field within the destination word. Zero for every
    /// current descriptor, kept because the insertion math is defined over it.
    pub bit_pos: u32,
    pub overflow: OverflowPolicy,
    pub pc_relative: bool,
    /// Bits of the destination word that belong to the field.
    pub dst_mask: u32,
    /// Whether the field's prior content contributes to the relocated value.
    pub partial_inplace: bool,
    pub special: RelocationSpecial,
    pub name: &'static str,
}

impl RelocationKindInfo {
    /// Checks `value` against the overflow policy. The check is applied to
    /// the value before shifting, matching how the field will be consumed.
    pub fn check_value(&self, value: i64) -> Result<(), FieldOverflow> {
        let shifted = value >> self.right_shift;
        let fits = match self.overflow {
            OverflowPolicy::Ignore => true,
            OverflowPolicy::Signed => {
                let min = -(1i64 << (self.bit_width - 1));
                let max = (1i64 << (self.bit_width - 1)) - 1;
                (min..=max).contains(&shifted)
            }
            OverflowPolicy::Bitfield => {
                let min = -(1i64 << (self.bit_width - 1));
                let max = (1i64 << self.bit_width) - 1;
                (min..=max).contains(&shifted)
            }
        };
        if fits {
            Ok(())
        } else {
            Err(FieldOverflow {
                value,
                bit_width: self.bit_width,
            })
        }
    }

    /// Packs `value` into the destination field inside `word`, leaving bits
    /// outside `dst_mask` untouched. Does not perform the overflow check;
    /// callers decide how to report that separately.
    #[must_use]
    pub fn insert(&self, word: u32, value: i64) -> u32 {
        let field = ((value >> self.right_shift) as u32) << self.bit_pos;
        (word & !self.dst_mask) | (field & self.dst_mask)
    }

    /// Recovers the field from `word`, undoing the shifts of [`Self::insert`].
    /// Sign-extends when the overflow policy treats the field as signed.
    #[must_use]
    pub fn extract(&self, word: u32) -> i64 {
        let field = (word & self.dst_mask) >> self.bit_pos;
        let value = match self.overflow {
            OverflowPolicy::Signed => {
                let shift = 32 - self.bit_width;
                (((field << shift) as i32) >> shift) as i64
            }
            _ => field as i64,
        };
        value << self.right_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(bit_width: u32, overflow: OverflowPolicy) -> RelocationKindInfo {
        RelocationKindInfo {
            kind: RelocationKind::Absolute,
            byte_size: 4,
            bit_width,
            right_shift: 0,
            bit_pos: 0,
            overflow,
            pc_relative: false,
            dst_mask: (1u64 << bit_width) as u32 - 1,
            partial_inplace: false,
            special: RelocationSpecial::None,
            name: "TEST",
        }
    }

    #[test]
    fn signed_overflow_bounds() {
        let d = descriptor(16, OverflowPolicy::Signed);
        assert!(d.check_value(32767).is_ok());
        assert!(d.check_value(-32768).is_ok());
        assert!(d.check_value(32768).is_err());
        assert!(d.check_value(-32769).is_err());
    }

    #[test]
    fn bitfield_accepts_either_interpretation() {
        let d = descriptor(16, OverflowPolicy::Bitfield);
        assert!(d.check_value(0xffff).is_ok());
        assert!(d.check_value(-32768).is_ok());
        assert!(d.check_value(0x10000).is_err());
    }

    #[test]
    fn insert_preserves_unrelated_bits() {
        let d = descriptor(16, OverflowPolicy::Signed);
        let word = d.insert(0xabcd_0000, 0x1234);
        assert_eq!(word, 0xabcd_1234);
    }
}
