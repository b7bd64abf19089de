//! PowerPC-32 relocation descriptors and instruction-level helpers. The
//! descriptor table is the single source of truth for how each relocation
//! type packs its field; everything else in the backend works in terms of
//! [`RelocationKindInfo`].

use crate::elf::OverflowPolicy;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::elf::RelocationSpecial;
use bitflags::bitflags;
use std::borrow::Cow;

/// `R_PPC_ADDR30` relocation type. The `object` crate does not expose this
/// PPC32 constant, but it shares the same numeric value as its PPC64 alias.
const R_PPC_ADDR30: u32 = object::elf::R_PPC64_ADDR30;

/// Offset of the thread pointer from the start of the TLS block.
pub const TP_OFFSET: u32 = 0x7000;

/// Offset applied to values stored in the dynamic thread vector.
pub const DTP_OFFSET: u32 = 0x8000;

/// Displacement range of an I-form branch (`b`, `bl`): signed 26 bits, word
/// aligned.
pub const BRANCH24_RANGE: std::ops::RangeInclusive<i64> = -0x0200_0000..=0x01ff_fffc;

/// Displacement range of a B-form conditional branch: signed 16 bits, word
/// aligned.
pub const BRANCH14_RANGE: std::ops::RangeInclusive<i64> = -0x8000..=0x7ffc;

#[must_use]
pub fn distance_fits_branch24(distance: i64) -> bool {
    distance & 3 == 0 && BRANCH24_RANGE.contains(&distance)
}

#[must_use]
pub fn distance_fits_branch14(distance: i64) -> bool {
    distance & 3 == 0 && BRANCH14_RANGE.contains(&distance)
}

/// High half of `value` adjusted for the sign extension performed by the
/// consumer of the paired low half. Equal to `value >> 16` plus one whenever
/// bit 15 of the low half is set.
#[must_use]
pub const fn ha(value: u32) -> u32 {
    value.wrapping_add(0x8000) >> 16
}

#[must_use]
pub const fn lo(value: u32) -> u32 {
    value & 0xffff
}

#[must_use]
pub const fn sign_extend16(value: u32) -> i32 {
    value as u16 as i16 as i32
}

bitflags! {
    /// Which TLS access models have been observed for a symbol. The scanner
    /// sets the strong bits; the optimizer clears them and sets weaker ones.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TlsMask: u8 {
        /// General-dynamic: module id + offset pair in the GOT.
        const GD = 1 << 0;
        /// Local-dynamic: shared module-id pair in the GOT.
        const LD = 1 << 1;
        /// Initial/local-exec: thread-pointer-relative slot or immediate.
        const TPREL = 1 << 2;
        /// DTV-relative immediate.
        const DTPREL = 1 << 3;
        /// A general-dynamic access downgraded to initial-exec.
        const TPREL_GD = 1 << 4;
        /// Modern marker relocations were seen alongside the access.
        const MARKERS = 1 << 5;
    }
}

const fn info(
    kind: RelocationKind,
    byte_size: usize,
    bit_width: u32,
    right_shift: u32,
    overflow: OverflowPolicy,
    pc_relative: bool,
    dst_mask: u32,
    special: RelocationSpecial,
    name: &'static str,
) -> RelocationKindInfo {
    RelocationKindInfo {
        kind,
        byte_size,
        bit_width,
        right_shift,
        bit_pos: 0,
        overflow,
        pc_relative,
        dst_mask,
        partial_inplace: false,
        special,
        name,
    }
}

/// Descriptor lookup by raw ELF relocation type. Returns `None` for types we
/// don't handle, which the caller reports as a fatal malformed-input error.
#[must_use]
pub const fn relocation_type_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
    use OverflowPolicy::Bitfield;
    use OverflowPolicy::Ignore;
    use OverflowPolicy::Signed;
    use RelocationKind as K;
    use RelocationSpecial::ForceDynamic;
    use RelocationSpecial::HighAdjust;
    use RelocationSpecial::None as NoSpecial;

    let i = match r_type {
        object::elf::R_PPC_NONE => info(
            K::None, 0, 0, 0, Ignore, false, 0, NoSpecial, "R_PPC_NONE",
        ),
        object::elf::R_PPC_ADDR32 => info(
            K::Absolute, 4, 32, 0, Ignore, false, 0xffff_ffff, NoSpecial, "R_PPC_ADDR32",
        ),
        object::elf::R_PPC_ADDR24 => info(
            K::Branch, 4, 26, 0, Bitfield, false, 0x03ff_fffc, NoSpecial, "R_PPC_ADDR24",
        ),
        object::elf::R_PPC_ADDR16 => info(
            K::Absolute, 2, 16, 0, Bitfield, false, 0xffff, NoSpecial, "R_PPC_ADDR16",
        ),
        object::elf::R_PPC_ADDR16_LO => info(
            K::Absolute, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_ADDR16_LO",
        ),
        object::elf::R_PPC_ADDR16_HI => info(
            K::Absolute, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_ADDR16_HI",
        ),
        object::elf::R_PPC_ADDR16_HA => info(
            K::Absolute, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_ADDR16_HA",
        ),
        object::elf::R_PPC_ADDR14 => info(
            K::Branch, 4, 16, 0, Bitfield, false, 0xfffc, NoSpecial, "R_PPC_ADDR14",
        ),
        object::elf::R_PPC_ADDR14_BRTAKEN => info(
            K::Branch, 4, 16, 0, Bitfield, false, 0xfffc, NoSpecial, "R_PPC_ADDR14_BRTAKEN",
        ),
        object::elf::R_PPC_ADDR14_BRNTAKEN => info(
            K::Branch, 4, 16, 0, Bitfield, false, 0xfffc, NoSpecial, "R_PPC_ADDR14_BRNTAKEN",
        ),
        object::elf::R_PPC_REL24 => info(
            K::BranchRelative, 4, 26, 0, Signed, true, 0x03ff_fffc, NoSpecial, "R_PPC_REL24",
        ),
        object::elf::R_PPC_REL14 => info(
            K::BranchRelative, 4, 16, 0, Signed, true, 0xfffc, NoSpecial, "R_PPC_REL14",
        ),
        object::elf::R_PPC_REL14_BRTAKEN => info(
            K::BranchRelative, 4, 16, 0, Signed, true, 0xfffc, NoSpecial, "R_PPC_REL14_BRTAKEN",
        ),
        object::elf::R_PPC_REL14_BRNTAKEN => info(
            K::BranchRelative, 4, 16, 0, Signed, true, 0xfffc, NoSpecial,
            "R_PPC_REL14_BRNTAKEN",
        ),
        object::elf::R_PPC_GOT16 => info(
            K::Got, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_GOT16",
        ),
        object::elf::R_PPC_GOT16_LO => info(
            K::Got, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT16_LO",
        ),
        object::elf::R_PPC_GOT16_HI => info(
            K::Got, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT16_HI",
        ),
        object::elf::R_PPC_GOT16_HA => info(
            K::Got, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_GOT16_HA",
        ),
        object::elf::R_PPC_PLTREL24 => info(
            K::PltBranch, 4, 26, 0, Signed, true, 0x03ff_fffc, NoSpecial, "R_PPC_PLTREL24",
        ),
        object::elf::R_PPC_COPY => info(
            K::Copy, 0, 0, 0, Ignore, false, 0, ForceDynamic, "R_PPC_COPY",
        ),
        object::elf::R_PPC_GLOB_DAT => info(
            K::GlobDat, 4, 32, 0, Ignore, false, 0xffff_ffff, ForceDynamic, "R_PPC_GLOB_DAT",
        ),
        object::elf::R_PPC_JMP_SLOT => info(
            K::JumpSlot, 0, 0, 0, Ignore, false, 0, ForceDynamic, "R_PPC_JMP_SLOT",
        ),
        object::elf::R_PPC_RELATIVE => info(
            K::Absolute, 4, 32, 0, Ignore, false, 0xffff_ffff, ForceDynamic, "R_PPC_RELATIVE",
        ),
        object::elf::R_PPC_LOCAL24PC => info(
            K::BranchRelative, 4, 26, 0, Signed, true, 0x03ff_fffc, NoSpecial, "R_PPC_LOCAL24PC",
        ),
        object::elf::R_PPC_UADDR32 => info(
            K::Absolute, 4, 32, 0, Ignore, false, 0xffff_ffff, NoSpecial, "R_PPC_UADDR32",
        ),
        object::elf::R_PPC_UADDR16 => info(
            K::Absolute, 2, 16, 0, Bitfield, false, 0xffff, NoSpecial, "R_PPC_UADDR16",
        ),
        object::elf::R_PPC_REL32 => info(
            K::Relative, 4, 32, 0, Ignore, true, 0xffff_ffff, NoSpecial, "R_PPC_REL32",
        ),
        object::elf::R_PPC_PLT32 => info(
            K::PltAddr, 4, 32, 0, Ignore, false, 0xffff_ffff, NoSpecial, "R_PPC_PLT32",
        ),
        object::elf::R_PPC_PLTREL32 => info(
            K::PltAddr, 4, 32, 0, Ignore, true, 0xffff_ffff, NoSpecial, "R_PPC_PLTREL32",
        ),
        object::elf::R_PPC_PLT16_LO => info(
            K::PltAddr, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_PLT16_LO",
        ),
        object::elf::R_PPC_PLT16_HI => info(
            K::PltAddr, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_PLT16_HI",
        ),
        object::elf::R_PPC_PLT16_HA => info(
            K::PltAddr, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_PLT16_HA",
        ),
        object::elf::R_PPC_SDAREL16 => info(
            K::SdaRelative, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_SDAREL16",
        ),
        object::elf::R_PPC_SECTOFF => info(
            K::SectionOffset, 2, 16, 0, Bitfield, false, 0xffff, NoSpecial, "R_PPC_SECTOFF",
        ),
        object::elf::R_PPC_SECTOFF_LO => info(
            K::SectionOffset, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_SECTOFF_LO",
        ),
        object::elf::R_PPC_SECTOFF_HI => info(
            K::SectionOffset, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_SECTOFF_HI",
        ),
        object::elf::R_PPC_SECTOFF_HA => info(
            K::SectionOffset, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_SECTOFF_HA",
        ),
        R_PPC_ADDR30 => info(
            K::Relative, 4, 30, 2, Ignore, true, 0x3fff_ffff, NoSpecial, "R_PPC_ADDR30",
        ),
        object::elf::R_PPC_TLS => info(
            K::TlsMark, 0, 0, 0, Ignore, false, 0, NoSpecial, "R_PPC_TLS",
        ),
        object::elf::R_PPC_DTPMOD32 => info(
            K::DtpMod, 4, 32, 0, Ignore, false, 0xffff_ffff, ForceDynamic, "R_PPC_DTPMOD32",
        ),
        object::elf::R_PPC_TPREL16 => info(
            K::TpRel, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_TPREL16",
        ),
        object::elf::R_PPC_TPREL16_LO => info(
            K::TpRel, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_TPREL16_LO",
        ),
        object::elf::R_PPC_TPREL16_HI => info(
            K::TpRel, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_TPREL16_HI",
        ),
        object::elf::R_PPC_TPREL16_HA => info(
            K::TpRel, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_TPREL16_HA",
        ),
        object::elf::R_PPC_TPREL32 => info(
            K::TpRel, 4, 32, 0, Ignore, false, 0xffff_ffff, NoSpecial, "R_PPC_TPREL32",
        ),
        object::elf::R_PPC_DTPREL16 => info(
            K::DtpRel, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_DTPREL16",
        ),
        object::elf::R_PPC_DTPREL16_LO => info(
            K::DtpRel, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_DTPREL16_LO",
        ),
        object::elf::R_PPC_DTPREL16_HI => info(
            K::DtpRel, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_DTPREL16_HI",
        ),
        object::elf::R_PPC_DTPREL16_HA => info(
            K::DtpRel, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_DTPREL16_HA",
        ),
        object::elf::R_PPC_DTPREL32 => info(
            K::DtpRel, 4, 32, 0, Ignore, false, 0xffff_ffff, NoSpecial, "R_PPC_DTPREL32",
        ),
        object::elf::R_PPC_GOT_TLSGD16 => info(
            K::GotTlsGd, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_GOT_TLSGD16",
        ),
        object::elf::R_PPC_GOT_TLSGD16_LO => info(
            K::GotTlsGd, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_TLSGD16_LO",
        ),
        object::elf::R_PPC_GOT_TLSGD16_HI => info(
            K::GotTlsGd, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_TLSGD16_HI",
        ),
        object::elf::R_PPC_GOT_TLSGD16_HA => info(
            K::GotTlsGd, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_GOT_TLSGD16_HA",
        ),
        object::elf::R_PPC_GOT_TLSLD16 => info(
            K::GotTlsLd, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_GOT_TLSLD16",
        ),
        object::elf::R_PPC_GOT_TLSLD16_LO => info(
            K::GotTlsLd, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_TLSLD16_LO",
        ),
        object::elf::R_PPC_GOT_TLSLD16_HI => info(
            K::GotTlsLd, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_TLSLD16_HI",
        ),
        object::elf::R_PPC_GOT_TLSLD16_HA => info(
            K::GotTlsLd, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_GOT_TLSLD16_HA",
        ),
        object::elf::R_PPC_GOT_TPREL16 => info(
            K::GotTpRel, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_GOT_TPREL16",
        ),
        object::elf::R_PPC_GOT_TPREL16_LO => info(
            K::GotTpRel, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_TPREL16_LO",
        ),
        object::elf::R_PPC_GOT_TPREL16_HI => info(
            K::GotTpRel, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_TPREL16_HI",
        ),
        object::elf::R_PPC_GOT_TPREL16_HA => info(
            K::GotTpRel, 2, 16, 16, Ignore, false, 0xffff, HighAdjust, "R_PPC_GOT_TPREL16_HA",
        ),
        object::elf::R_PPC_GOT_DTPREL16 => info(
            K::GotDtpRel, 2, 16, 0, Signed, false, 0xffff, NoSpecial, "R_PPC_GOT_DTPREL16",
        ),
        object::elf::R_PPC_GOT_DTPREL16_LO => info(
            K::GotDtpRel, 2, 16, 0, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_DTPREL16_LO",
        ),
        object::elf::R_PPC_GOT_DTPREL16_HI => info(
            K::GotDtpRel, 2, 16, 16, Ignore, false, 0xffff, NoSpecial, "R_PPC_GOT_DTPREL16_HI",
        ),
        object::elf::R_PPC_GOT_DTPREL16_HA => info(
            K::GotDtpRel, 2, 16, 16, Ignore, false, 0xffff, HighAdjust,
            "R_PPC_GOT_DTPREL16_HA",
        ),
        object::elf::R_PPC_TLSGD => info(
            K::TlsGdMark, 0, 0, 0, Ignore, false, 0, NoSpecial, "R_PPC_TLSGD",
        ),
        object::elf::R_PPC_TLSLD => info(
            K::TlsLdMark, 0, 0, 0, Ignore, false, 0, NoSpecial, "R_PPC_TLSLD",
        ),
        object::elf::R_PPC_EMB_SDA21 => info(
            K::SdaBased21, 4, 16, 0, Signed, false, 0x001f_ffff, NoSpecial, "R_PPC_EMB_SDA21",
        ),
        object::elf::R_PPC_IRELATIVE => info(
            K::Irelative, 4, 32, 0, Ignore, false, 0xffff_ffff, ForceDynamic, "R_PPC_IRELATIVE",
        ),
        object::elf::R_PPC_REL16 => info(
            K::Relative, 2, 16, 0, Signed, true, 0xffff, NoSpecial, "R_PPC_REL16",
        ),
        object::elf::R_PPC_REL16_LO => info(
            K::Relative, 2, 16, 0, Ignore, true, 0xffff, NoSpecial, "R_PPC_REL16_LO",
        ),
        object::elf::R_PPC_REL16_HI => info(
            K::Relative, 2, 16, 16, Ignore, true, 0xffff, NoSpecial, "R_PPC_REL16_HI",
        ),
        object::elf::R_PPC_REL16_HA => info(
            K::Relative, 2, 16, 16, Ignore, true, 0xffff, HighAdjust, "R_PPC_REL16_HA",
        ),
        _ => return None,
    };
    Some(i)
}

/// Raw types of every descriptor in the table, for name-based lookup and for
/// exhaustive table tests.
pub const SUPPORTED_RELOCATIONS: &[u32] = &[
    object::elf::R_PPC_NONE,
    object::elf::R_PPC_ADDR32,
    object::elf::R_PPC_ADDR24,
    object::elf::R_PPC_ADDR16,
    object::elf::R_PPC_ADDR16_LO,
    object::elf::R_PPC_ADDR16_HI,
    object::elf::R_PPC_ADDR16_HA,
    object::elf::R_PPC_ADDR14,
    object::elf::R_PPC_ADDR14_BRTAKEN,
    object::elf::R_PPC_ADDR14_BRNTAKEN,
    object::elf::R_PPC_REL24,
    object::elf::R_PPC_REL14,
    object::elf::R_PPC_REL14_BRTAKEN,
    object::elf::R_PPC_REL14_BRNTAKEN,
    object::elf::R_PPC_GOT16,
    object::elf::R_PPC_GOT16_LO,
    object::elf::R_PPC_GOT16_HI,
    object::elf::R_PPC_GOT16_HA,
    object::elf::R_PPC_PLTREL24,
    object::elf::R_PPC_COPY,
    object::elf::R_PPC_GLOB_DAT,
    object::elf::R_PPC_JMP_SLOT,
    object::elf::R_PPC_RELATIVE,
    object::elf::R_PPC_LOCAL24PC,
    object::elf::R_PPC_UADDR32,
    object::elf::R_PPC_UADDR16,
    object::elf::R_PPC_REL32,
    object::elf::R_PPC_PLT32,
    object::elf::R_PPC_PLTREL32,
    object::elf::R_PPC_PLT16_LO,
    object::elf::R_PPC_PLT16_HI,
    object::elf::R_PPC_PLT16_HA,
    object::elf::R_PPC_SDAREL16,
    object::elf::R_PPC_SECTOFF,
    object::elf::R_PPC_SECTOFF_LO,
    object::elf::R_PPC_SECTOFF_HI,
    object::elf::R_PPC_SECTOFF_HA,
    R_PPC_ADDR30,
    object::elf::R_PPC_TLS,
    object::elf::R_PPC_DTPMOD32,
    object::elf::R_PPC_TPREL16,
    object::elf::R_PPC_TPREL16_LO,
    object::elf::R_PPC_TPREL16_HI,
    object::elf::R_PPC_TPREL16_HA,
    object::elf::R_PPC_TPREL32,
    object::elf::R_PPC_DTPREL16,
    object::elf::R_PPC_DTPREL16_LO,
    object::elf::R_PPC_DTPREL16_HI,
    object::elf::R_PPC_DTPREL16_HA,
    object::elf::R_PPC_DTPREL32,
    object::elf::R_PPC_GOT_TLSGD16,
    object::elf::R_PPC_GOT_TLSGD16_LO,
    object::elf::R_PPC_GOT_TLSGD16_HI,
    object::elf::R_PPC_GOT_TLSGD16_HA,
    object::elf::R_PPC_GOT_TLSLD16,
    object::elf::R_PPC_GOT_TLSLD16_LO,
    object::elf::R_PPC_GOT_TLSLD16_HI,
    object::elf::R_PPC_GOT_TLSLD16_HA,
    object::elf::R_PPC_GOT_TPREL16,
    object::elf::R_PPC_GOT_TPREL16_LO,
    object::elf::R_PPC_GOT_TPREL16_HI,
    object::elf::R_PPC_GOT_TPREL16_HA,
    object::elf::R_PPC_GOT_DTPREL16,
    object::elf::R_PPC_GOT_DTPREL16_LO,
    object::elf::R_PPC_GOT_DTPREL16_HI,
    object::elf::R_PPC_GOT_DTPREL16_HA,
    object::elf::R_PPC_TLSGD,
    object::elf::R_PPC_TLSLD,
    object::elf::R_PPC_EMB_SDA21,
    object::elf::R_PPC_IRELATIVE,
    object::elf::R_PPC_REL16,
    object::elf::R_PPC_REL16_LO,
    object::elf::R_PPC_REL16_HI,
    object::elf::R_PPC_REL16_HA,
];

#[must_use]
pub fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    match relocation_type_from_raw(r_type) {
        Some(i) => Cow::Borrowed(i.name),
        None => Cow::Owned(format!("Unknown relocation type 0x{r_type:x} ({r_type})")),
    }
}

/// Name-based descriptor lookup, case-insensitive. Only used on cold
/// diagnostic paths, so a linear scan over the table is fine.
#[must_use]
pub fn relocation_type_by_name(name: &str) -> Option<(u32, RelocationKindInfo)> {
    SUPPORTED_RELOCATIONS.iter().find_map(|&r_type| {
        let i = relocation_type_from_raw(r_type)?;
        i.name.eq_ignore_ascii_case(name).then_some((r_type, i))
    })
}

/// Instruction words and D-field builders for the code the linker itself
/// synthesizes. Register operands are plain numbers; callers use the ABI
/// names in comments where it matters.
pub mod insn {
    pub const NOP: u32 = 0x6000_0000; // ori 0,0,0
    pub const BLR: u32 = 0x4e80_0020;
    pub const BCTR: u32 = 0x4e80_0420;
    /// `bcl 20,31,.+4`: branch-and-link used to read the program counter.
    pub const BCL_NEXT: u32 = 0x429f_0005;

    #[must_use]
    pub const fn addi(rt: u32, ra: u32, imm: u32) -> u32 {
        0x3800_0000 | rt << 21 | ra << 16 | (imm & 0xffff)
    }

    #[must_use]
    pub const fn addis(rt: u32, ra: u32, imm: u32) -> u32 {
        0x3c00_0000 | rt << 21 | ra << 16 | (imm & 0xffff)
    }

    /// `lis` is `addis` with a zero base register.
    #[must_use]
    pub const fn lis(rt: u32, imm: u32) -> u32 {
        addis(rt, 0, imm)
    }

    #[must_use]
    pub const fn add(rt: u32, ra: u32, rb: u32) -> u32 {
        0x7c00_0214 | rt << 21 | ra << 16 | rb << 11
    }

    #[must_use]
    pub const fn subf(rt: u32, ra: u32, rb: u32) -> u32 {
        0x7c00_0050 | rt << 21 | ra << 16 | rb << 11
    }

    #[must_use]
    pub const fn lwz(rt: u32, ra: u32, disp: u32) -> u32 {
        0x8000_0000 | rt << 21 | ra << 16 | (disp & 0xffff)
    }

    #[must_use]
    pub const fn lwzu(rt: u32, ra: u32, disp: u32) -> u32 {
        0x8400_0000 | rt << 21 | ra << 16 | (disp & 0xffff)
    }

    #[must_use]
    pub const fn mtctr(rs: u32) -> u32 {
        0x7c09_03a6 | rs << 21
    }

    #[must_use]
    pub const fn mflr(rt: u32) -> u32 {
        0x7c08_02a6 | rt << 21
    }

    #[must_use]
    pub const fn mtlr(rs: u32) -> u32 {
        0x7c08_03a6 | rs << 21
    }

    /// Unconditional I-form branch with the given signed displacement.
    #[must_use]
    pub const fn b(disp: i32) -> u32 {
        0x4800_0000 | (disp as u32 & 0x03ff_fffc)
    }

    #[must_use]
    pub const fn bl(disp: i32) -> u32 {
        b(disp) | 1
    }

    /// `cmplw cr7,ra,rb`.
    #[must_use]
    pub const fn cmplw_cr7(ra: u32, rb: u32) -> u32 {
        0x7f80_0040 | ra << 16 | rb << 11
    }

    /// `bne cr7,disp` (B-form, signed 16-bit displacement).
    #[must_use]
    pub const fn bne_cr7(disp: i32) -> u32 {
        0x409e_0000 | (disp as u32 & 0xfffc)
    }

    /// `rlwinm rt,rs,sh,mb,me`.
    #[must_use]
    pub const fn rlwinm(rt: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
        0x5400_0000 | rs << 21 | rt << 16 | sh << 11 | mb << 6 | me << 1
    }

    #[must_use]
    pub const fn primary_opcode(word: u32) -> u32 {
        word >> 26
    }

    /// Whether this is an I-form branch (`b`/`bl`/`ba`/`bla`).
    #[must_use]
    pub const fn is_direct_branch(word: u32) -> bool {
        primary_opcode(word) == 18
    }

    /// Whether this is a B-form conditional branch.
    #[must_use]
    pub const fn is_conditional_branch(word: u32) -> bool {
        primary_opcode(word) == 16
    }
}

/// Overflow policy for a 16-bit immediate, decided by the enclosing
/// instruction's primary opcode. Logical immediates are zero-extended by the
/// hardware, so a value that only fits unsigned is acceptable there;
/// arithmetic immediates and load/store displacements are sign-extended.
/// Opcodes we don't recognize get the permissive bitfield policy so that data
/// words mixed into code sections don't produce spurious diagnostics.
#[must_use]
pub fn immediate_field_policy(word: u32) -> OverflowPolicy {
    match insn::primary_opcode(word) {
        // twi, mulli, subfic, cmpi, addic, addic., addi, addis
        3 | 7 | 8 | 11 | 12 | 13 | 14 | 15 => OverflowPolicy::Signed,
        // cmpli, ori, oris, xori, xoris, andi., andis.
        10 | 24 | 25 | 26 | 27 | 28 | 29 => OverflowPolicy::Bitfield,
        // All D-form loads and stores, integer and floating point.
        32..=55 => OverflowPolicy::Signed,
        _ => OverflowPolicy::Bitfield,
    }
}

/// Size of a long-branch trampoline: `lis r11 / addi r11 / mtctr r11 / bctr`.
pub const TRAMPOLINE_SIZE: u64 = 16;

/// Writes a trampoline that transfers control to `target` without any
/// displacement-range restriction. Clobbers r11 and ctr, both call-scratch in
/// the ABI.
pub fn write_trampoline(bytes: &mut [u8], target: u32) {
    let words = [
        insn::lis(11, ha(target)),
        insn::addi(11, 11, lo(target)),
        insn::mtctr(11),
        insn::BCTR,
    ];
    write_insns(bytes, &words);
}

/// Reads the big-endian instruction word at `offset`.
#[must_use]
pub fn read_insn(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub fn write_insn(bytes: &mut [u8], offset: usize, word: u32) {
    bytes[offset..offset + 4].copy_from_slice(&word.to_be_bytes());
}

pub fn write_insns(bytes: &mut [u8], words: &[u32]) {
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::OverflowPolicy;

    /// Packing a value into a descriptor's field and re-extracting it must be
    /// the identity for every representable value of every descriptor.
    #[test]
    fn field_round_trip() {
        for &r_type in SUPPORTED_RELOCATIONS {
            let info = relocation_type_from_raw(r_type).unwrap();
            if info.dst_mask == 0 {
                continue;
            }
            let samples: &[i64] = match info.overflow {
                OverflowPolicy::Signed => &[
                    0,
                    4,
                    -4,
                    (1 << (info.bit_width - 1)) - 4,
                    -(1 << (info.bit_width - 1)),
                ],
                _ => &[0, 4, (1i64 << info.bit_width) - 4],
            };
            for &sample in samples {
                let value = (sample << info.right_shift) & !3;
                if info.check_value(value).is_err() {
                    continue;
                }
                let word = info.insert(0, value);
                let back = info.extract(word);
                // Unsigned extraction can't recover a negative value; compare
                // modulo the field width in that case.
                let mask = if info.right_shift >= 32 {
                    u64::MAX
                } else {
                    ((1u64 << info.bit_width) - 1) << info.right_shift
                };
                assert_eq!(
                    back as u64 & mask,
                    value as u64 & mask,
                    "{} failed round trip for 0x{value:x}",
                    info.name
                );
            }
        }
    }

    /// The high-adjusted half plus the sign-extended low half must
    /// reconstitute the original word for any 32-bit value.
    #[test]
    fn high_adjusted_pairs_with_signed_low() {
        for value in [
            0u32,
            1,
            0x7fff,
            0x8000,
            0x8001,
            0xffff,
            0x1_0000,
            0x1234_5678,
            0x7fff_ffff,
            0x8000_0000,
            0xffff_7fff,
            0xffff_8000,
            0xffff_ffff,
        ] {
            let reconstructed = (ha(value) << 16).wrapping_add(sign_extend16(lo(value)) as u32);
            assert_eq!(reconstructed, value, "value 0x{value:x}");
        }
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let (r_type, info) = relocation_type_by_name("r_ppc_addr16_ha").unwrap();
        assert_eq!(r_type, object::elf::R_PPC_ADDR16_HA);
        assert_eq!(info.name, "R_PPC_ADDR16_HA");
        assert!(relocation_type_by_name("R_PPC_NO_SUCH").is_none());
    }

    #[test]
    fn immediate_policy_table() {
        assert_eq!(
            immediate_field_policy(insn::addi(3, 3, 0)),
            OverflowPolicy::Signed
        );
        assert_eq!(
            immediate_field_policy(0x6000_0000), // ori
            OverflowPolicy::Bitfield
        );
        assert_eq!(
            immediate_field_policy(insn::lwz(9, 1, 8)),
            OverflowPolicy::Signed
        );
    }

    #[test]
    fn trampoline_addresses_full_range() {
        let mut bytes = [0u8; 16];
        write_trampoline(&mut bytes, 0xdead_beec);
        assert_eq!(read_insn(&bytes, 0), insn::lis(11, 0xdeae));
        assert_eq!(read_insn(&bytes, 4), insn::addi(11, 11, 0xbeec));
        assert_eq!(read_insn(&bytes, 8), insn::mtctr(11));
        assert_eq!(read_insn(&bytes, 12), insn::BCTR);
    }
}
