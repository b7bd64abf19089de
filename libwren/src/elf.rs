//! Sizes and record types for the sections the linker synthesizes. All
//! multi-byte values in the output are big-endian.

use object::BigEndian;
use object::I32;
use object::U32;

pub(crate) type Rela = object::elf::Rela32<BigEndian>;

pub(crate) const RELA_ENTRY_SIZE: u32 = size_of::<Rela>() as u32;

pub(crate) const GOT_ENTRY_SIZE: u32 = 4;

/// Secure-PLT `.plt` is a table of resolved addresses, one word per entry.
pub(crate) const PLT_SLOT_SIZE: u32 = 4;

/// Words at the start of the secure `.plt` reserved for the resolver: binder
/// entry point and link-map pointer, filled by the loader.
pub(crate) const PLT_HEADER_SIZE: u32 = 8;

/// A secure-PLT call stub: load the slot, move to ctr, branch.
pub(crate) const GLINK_ENTRY_SIZE: u32 = 16;

/// The shared lazy-resolution trailer of the stub section.
pub(crate) const GLINK_RESOLVE_SIZE: u32 = 64;

/// Fast-path stub placed in front of the resolver for `__tls_get_addr`.
pub(crate) const TLS_GET_ADDR_STUB_SIZE: u32 = 32;

/// Legacy `.plt` slots are patched and executed by the loader; the linker
/// only sizes the section.
pub(crate) const LEGACY_PLT_HEADER_SIZE: u32 = 72;
pub(crate) const LEGACY_PLT_SLOT_SIZE: u32 = 8;

pub(crate) const SECURE_GOT_HEADER_SIZE: u32 = 12;
pub(crate) const LEGACY_GOT_HEADER_SIZE: u32 = 16;

/// GOT offsets are addressed by signed 16-bit fields relative to the GOT
/// pointer, which sits at the header. Allocations made before this boundary
/// is reached are guaranteed representable; the boundary differs between the
/// schemes because the legacy GOT pointer is biased by one word.
pub(crate) const SECURE_GOT_BOUNDARY: u32 = 32768;
pub(crate) const LEGACY_GOT_BOUNDARY: u32 = 32764;

/// Bias applied to the small-data base symbol relative to `.sdata`.
pub(crate) const SDA_BASE_OFFSET: u32 = 0x8000;

pub(crate) fn new_rela(offset: u32, r_type: u32, symbol: u32, addend: i32) -> Rela {
    Rela {
        r_offset: U32::new(BigEndian, offset),
        r_info: U32::new(BigEndian, (symbol << 8) | (r_type & 0xff)),
        r_addend: I32::new(BigEndian, addend),
    }
}

/// Serializes dynamic-relocation records in the order they were written.
pub(crate) fn rela_section_bytes(relas: &[Rela]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(relas.len() * RELA_ENTRY_SIZE as usize);
    for rela in relas {
        bytes.extend_from_slice(object::bytes_of(rela));
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rela_layout() {
        assert_eq!(RELA_ENTRY_SIZE, 12);
        let rela = new_rela(0x1000, object::elf::R_PPC_RELATIVE, 0, 0x20);
        let bytes = rela_section_bytes(&[rela]);
        assert_eq!(
            bytes,
            &[0, 0, 0x10, 0, 0, 0, 0, 22, 0, 0, 0, 0x20],
        );
    }
}
