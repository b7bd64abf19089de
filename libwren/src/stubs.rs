//! Synthesizes the machine code the linker contributes itself: secure-PLT
//! call stubs, the shared lazy-resolution sequence and the `__tls_get_addr`
//! fast path. Legacy links get none of this; their `.plt` is populated by
//! the runtime loader.
//!
//! Stub section layout: one 16-byte call stub per PLT entry, then one
//! lazy-resolution branch word per entry, then the optional TLS fast path,
//! then the resolver. A not-yet-resolved PLT slot holds the address of its
//! lazy branch word; the call stub leaves that address in r11, which is how
//! the resolver recovers the PLT index on first call.

use crate::LinkState;
use crate::bail;
use crate::elf;
use crate::ensure;
use crate::error::Result;
use crate::plan::PltScheme;
use crate::symbol_db::PltEntry;
use linker_utils::ppc32::ha;
use linker_utils::ppc32::insn;
use linker_utils::ppc32::lo;
use linker_utils::ppc32::write_insn;
use linker_utils::ppc32::write_insns;

pub(crate) struct StubSections {
    pub(crate) glink: Vec<u8>,
    pub(crate) plt: Vec<u8>,
}

/// Offsets of the pieces within the stub section.
struct GlinkLayout {
    lazy_base: u32,
    tls_stub_offset: Option<u32>,
    resolver_offset: u32,
}

fn glink_layout(state: &LinkState) -> GlinkLayout {
    let lazy_base = state.stats.call_stubs * elf::GLINK_ENTRY_SIZE;
    let lazy_end = lazy_base + state.stats.call_stubs * 4;
    let tls_stub_offset = state.tls_get_addr_stub.then_some(lazy_end);
    let resolver_offset = lazy_end
        + if state.tls_get_addr_stub {
            elf::TLS_GET_ADDR_STUB_SIZE
        } else {
            0
        };
    GlinkLayout {
        lazy_base,
        tls_stub_offset,
        resolver_offset,
    }
}

#[tracing::instrument(skip_all, name = "Emit stubs")]
pub(crate) fn emit(state: &mut LinkState) -> Result<StubSections> {
    let scheme = state
        .plt_scheme
        .expect("PLT scheme selected before stub emission");

    if scheme == PltScheme::Legacy {
        // Loader-patched slots: we only provide the (zeroed) memory image.
        return Ok(StubSections {
            glink: Vec::new(),
            plt: vec![0; state.plt_section_size as usize],
        });
    }

    let mut glink = vec![0u8; state.glink_size as usize];
    let mut plt = vec![0u8; state.plt_section_size as usize];
    let layout = glink_layout(state);

    let entries: Vec<PltEntry> = state.plt.entries.clone();
    for entry in &entries {
        let (Some(slot_offset), Some(stub_offset)) = (entry.offset(), entry.stub_offset) else {
            continue;
        };
        write_call_stub(state, &mut glink, stub_offset, slot_offset)?;

        // Lazy branch word for this entry, indexed by the slot so the
        // resolver recovers the right PLT index, and the slot's initial
        // value pointing at it. Slots whose records resolve them eagerly are
        // simply overwritten by the loader before first use.
        let slot_index = (slot_offset - elf::PLT_HEADER_SIZE) / elf::PLT_SLOT_SIZE;
        let lazy_offset = layout.lazy_base + slot_index * 4;
        let to_resolver = i64::from(layout.resolver_offset) - i64::from(lazy_offset);
        write_insn(&mut glink, lazy_offset as usize, insn::b(to_resolver as i32));
        let lazy_address = state.layout.glink_address + lazy_offset;
        plt[slot_offset as usize..slot_offset as usize + 4]
            .copy_from_slice(&lazy_address.to_be_bytes());
    }

    if let Some(tls_offset) = layout.tls_stub_offset {
        write_tls_get_addr_stub(state, &mut glink, tls_offset)?;
    }
    write_resolver(state, &mut glink, &layout)?;

    Ok(StubSections { glink, plt })
}

/// A secure-PLT call stub. Executables know the slot's absolute address;
/// position-independent output addresses it relative to the GOT pointer in
/// r30.
fn write_call_stub(
    state: &LinkState,
    glink: &mut [u8],
    stub_offset: u32,
    slot_offset: u32,
) -> Result {
    let slot_address = state.layout.plt_address + slot_offset;
    let words = if state.args.output_kind.is_relocatable() {
        let got_pointer = state.layout.got_address + state.got.base_offset();
        let disp = i64::from(slot_address) - i64::from(got_pointer);
        ensure!(
            (-0x8000..=0x7fff).contains(&disp),
            "PLT slot out of reach of the GOT pointer"
        );
        [
            insn::lwz(11, 30, disp as u32),
            insn::mtctr(11),
            insn::BCTR,
            insn::NOP,
        ]
    } else {
        [
            insn::lis(11, ha(slot_address)),
            insn::lwz(11, 11, lo(slot_address)),
            insn::mtctr(11),
            insn::BCTR,
        ]
    };
    write_insns(&mut glink[stub_offset as usize..(stub_offset + elf::GLINK_ENTRY_SIZE) as usize], &words);
    Ok(())
}

/// Fast path for `__tls_get_addr`: if the requested module is the one this
/// thread resolved last (its id is cached one word below the thread
/// pointer), the offset word of the parameter block is pre-biased and the
/// result is a plain add. Anything else falls through to the ordinary call
/// stub.
fn write_tls_get_addr_stub(state: &LinkState, glink: &mut [u8], offset: u32) -> Result {
    let Some(id) = state.tls_get_addr_id() else {
        bail!("Internal error: TLS fast path emitted without __tls_get_addr");
    };
    let stub_offset = state
        .db
        .symbol(id)
        .ext
        .plt
        .iter()
        .find_map(|&plt_id| state.plt.entry(plt_id).stub_offset);
    let Some(resolver_stub) = stub_offset else {
        bail!("Internal error: TLS fast path emitted without a resolver call stub");
    };

    // Branch displacement from the final word of this stub to the ordinary
    // call stub.
    let fallback = i64::from(resolver_stub) - i64::from(offset + 28);
    let words = [
        insn::lwz(11, 3, 0),            // module id from the parameter block
        insn::lwz(0, 2, 0xfffc),        // id cached below the thread pointer
        insn::cmplw_cr7(11, 0),
        insn::bne_cr7(16),              // miss: take the full resolver
        insn::lwz(12, 3, 4),            // pre-biased offset
        insn::add(3, 2, 12),
        insn::BLR,
        insn::b(fallback as i32),
    ];
    write_insns(
        &mut glink[offset as usize..(offset + elf::TLS_GET_ADDR_STUB_SIZE) as usize],
        &words,
    );
    Ok(())
}

/// The shared lazy-resolution tail. On entry r11 holds the address of the
/// lazy branch word the stale PLT slot pointed at; the distance from the
/// first lazy word recovers the PLT index, which is scaled to the
/// relocation-table offset the binder expects. The binder entry point and
/// link-map pointer are the two words the loader deposits at the start of
/// the PLT.
fn write_resolver(state: &LinkState, glink: &mut [u8], layout: &GlinkLayout) -> Result {
    let glink_address = state.layout.glink_address;
    let lazy0 = glink_address + layout.lazy_base;
    let plt_header = state.layout.plt_address;
    let at = layout.resolver_offset;
    let neg_lazy0 = 0u32.wrapping_sub(lazy0);

    let mut words: Vec<u32> = vec![
        // r11 = 4 * index
        insn::addis(11, 11, ha(neg_lazy0)),
        insn::addi(11, 11, lo(neg_lazy0)),
    ];
    if state.args.output_kind.is_relocatable() {
        // Find the PLT header pc-relatively.
        let anchor = glink_address + at + 16; // address the bcl deposits
        let delta = plt_header.wrapping_sub(anchor);
        words.extend([
            insn::mflr(0),
            insn::BCL_NEXT,
            insn::mflr(12),
            insn::mtlr(0),
            insn::addis(12, 12, ha(delta)),
            insn::addi(12, 12, lo(delta)),
        ]);
    } else {
        words.extend([
            insn::lis(12, ha(plt_header)),
            insn::addi(12, 12, lo(plt_header)),
        ]);
    }
    words.extend([
        insn::lwz(0, 12, 0),  // binder entry point
        insn::lwz(12, 12, 4), // link-map pointer
        insn::mtctr(0),
        // Scale 4*index to the 12-byte relocation-table offset: 4i+4i+4i.
        insn::add(0, 11, 11),
        insn::add(11, 0, 11),
        insn::BCTR,
    ]);
    ensure!(
        words.len() * 4 <= elf::GLINK_RESOLVE_SIZE as usize,
        "Internal error: resolver exceeds its reserved size"
    );
    while words.len() * 4 < elf::GLINK_RESOLVE_SIZE as usize {
        words.push(insn::NOP);
    }
    write_insns(
        &mut glink[at as usize..(at + elf::GLINK_RESOLVE_SIZE) as usize],
        &words,
    );
    Ok(())
}
