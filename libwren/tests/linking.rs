//! End-to-end links over synthetic input objects, checking the externally
//! observable contract: section images, emitted dynamic relocations, stub
//! and GOT accounting.

use libwren::Args;
use libwren::LinkOutput;
use libwren::OutputKind;
use libwren::input::InputObject;
use libwren::input::InputRelocation;
use libwren::input::InputSection;
use libwren::input::InputSymbol;
use libwren::input::SymbolBinding;
use libwren::input::SymbolKind;
use libwren::input::SymbolPlacement;
use libwren::input::Visibility;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::shf;
use linker_utils::ppc32::insn;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn exec_flags() -> SectionFlags {
    shf::ALLOC.with(shf::EXECINSTR)
}

fn data_flags() -> SectionFlags {
    shf::ALLOC.with(shf::WRITE)
}

fn ro_flags() -> SectionFlags {
    shf::ALLOC
}

fn tls_flags() -> SectionFlags {
    shf::ALLOC.with(shf::WRITE).with(shf::TLS)
}

fn be_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn word_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn global(name: &str, kind: SymbolKind, placement: SymbolPlacement) -> InputSymbol {
    InputSymbol {
        name: name.to_owned(),
        value: 0,
        size: 0,
        placement,
        binding: SymbolBinding::Global,
        kind,
        visibility: Visibility::Default,
    }
}

fn undefined_function(name: &str) -> InputSymbol {
    global(name, SymbolKind::Function, SymbolPlacement::Undefined)
}

fn section<'out>(out: &'out LinkOutput, name: &str) -> &'out linker_layout::SectionImage {
    out.layout
        .sections
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no section named {name}"))
}

fn maybe_section<'out>(
    out: &'out LinkOutput,
    name: &str,
) -> Option<&'out linker_layout::SectionImage> {
    out.layout.sections.iter().find(|s| s.name == name)
}

fn summary<'out>(out: &'out LinkOutput, name: &str) -> &'out libwren::SymbolSummary {
    out.symbols
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no symbol named {name}"))
}

/// (r_offset, symbol index, r_type, addend) for every record in a
/// relocation section image.
fn parse_relas(bytes: &[u8]) -> Vec<(u32, u32, u32, i32)> {
    bytes
        .chunks_exact(12)
        .map(|chunk| {
            let info = u32::from_be_bytes(chunk[4..8].try_into().unwrap());
            (
                u32::from_be_bytes(chunk[0..4].try_into().unwrap()),
                info >> 8,
                info & 0xff,
                i32::from_be_bytes(chunk[8..12].try_into().unwrap()),
            )
        })
        .collect()
}

fn assert_parity(out: &LinkOutput) {
    assert_eq!(
        out.stats.dynamic_relocations_reserved, out.stats.dynamic_relocations_written,
        "reserved and written dynamic relocation counts must agree"
    );
}

fn caller_object(name: &str) -> InputObject {
    let mut obj = InputObject::new(name);
    let callee = obj.add_symbol(undefined_function("callee"));
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::bl(0)])).with_relocations(
            vec![InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_REL24,
                symbol: callee,
                addend: 0,
            }],
        ),
    );
    obj
}

#[test]
fn two_call_sites_share_one_plt_entry() {
    init_logging();
    let inputs = [caller_object("a.o"), caller_object("b.o")];
    let out = libwren::link(
        &inputs,
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    let callee = summary(&out, "callee");
    assert_eq!(callee.plt_entries, 1);
    assert_eq!(callee.call_stubs, 1);
    assert_eq!(callee.plt_references, 2);

    // One 16-byte stub, one lazy word, the resolver.
    assert_eq!(section(&out, ".glink").mem_size, 16 + 4 + 64);
    assert_eq!(section(&out, ".plt").mem_size, 8 + 4);
    let relas = parse_relas(&section(&out, ".rela.plt").bytes);
    assert_eq!(relas.len(), 1);
    assert_eq!(relas[0].2, object::elf::R_PPC_JMP_SLOT);
    assert_eq!(out.layout.dynamic_symbols, vec!["callee".to_owned()]);
    assert_parity(&out);
}

#[test]
fn general_dynamic_downgrades_to_local_exec() {
    init_logging();
    let mut obj = InputObject::new("tls.o");
    let tvar = obj.add_symbol(InputSymbol {
        size: 4,
        ..global("tvar", SymbolKind::Tls, SymbolPlacement::Section(1))
    });
    let tga = obj.add_symbol(undefined_function("__tls_get_addr"));
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::addi(3, 31, 0), insn::bl(0)]))
            .with_relocations(vec![
                InputRelocation {
                    offset: 2,
                    r_type: object::elf::R_PPC_GOT_TLSGD16,
                    symbol: tvar,
                    addend: 0,
                },
                InputRelocation {
                    offset: 4,
                    r_type: object::elf::R_PPC_REL24,
                    symbol: tga,
                    addend: 0,
                },
            ]),
    );
    obj.add_section(InputSection::progbits(".tdata", tls_flags(), vec![0; 4]));

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    // Both GOT words disappeared, and with them the resolver call stub.
    assert_eq!(summary(&out, "tvar").got_slots, 0);
    assert_eq!(summary(&out, "__tls_get_addr").plt_entries, 0);
    assert_eq!(out.stats.got_size, 12); // header only
    assert!(maybe_section(&out, ".glink").is_none());

    // The sequence was rewritten to addis/addi forming tp - 0x7000.
    let text = section(&out, ".text");
    assert_eq!(word_at(&text.bytes, 0), insn::addis(3, 2, 0));
    assert_eq!(word_at(&text.bytes, 4), insn::addi(3, 3, 0x9000));
    assert_parity(&out);
}

#[test]
fn tls_optimization_disabled_without_resolver_call() {
    init_logging();
    let mut obj = InputObject::new("tls.o");
    let tvar = obj.add_symbol(InputSymbol {
        size: 4,
        ..global("tvar", SymbolKind::Tls, SymbolPlacement::Section(1))
    });
    // A GOT TLS access with neither a marker relocation nor the expected
    // call right after it: the optimizer must stand down entirely.
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::addi(3, 31, 0)]))
            .with_relocations(vec![InputRelocation {
                offset: 2,
                r_type: object::elf::R_PPC_GOT_TLSGD16,
                symbol: tvar,
                addend: 0,
            }]),
    );
    obj.add_section(InputSection::progbits(".tdata", tls_flags(), vec![0; 4]));

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    assert_eq!(summary(&out, "tvar").got_slots, 2);
    assert_eq!(out.stats.got_size, 8 + 12);
    let got = section(&out, ".got");
    // An executable is always module 1; the offset word carries the
    // dtv-biased offset.
    assert_eq!(word_at(&got.bytes, 0), 1);
    assert_eq!(word_at(&got.bytes, 4), 0u32.wrapping_sub(0x8000));
    assert_parity(&out);
}

#[test]
fn shared_hidden_symbol_gets_only_relative_records() {
    init_logging();
    let mut obj = InputObject::new("so.o");
    let hidden = obj.add_symbol(InputSymbol {
        visibility: Visibility::Hidden,
        size: 4,
        ..global("hidden_sym", SymbolKind::Object, SymbolPlacement::Section(0))
    });
    obj.add_section(
        InputSection::progbits(".data", data_flags(), vec![0; 8]).with_relocations(vec![
            InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_ADDR32,
                symbol: hidden,
                addend: 0,
            },
            InputRelocation {
                offset: 4,
                r_type: object::elf::R_PPC_REL32,
                symbol: hidden,
                addend: 0,
            },
        ]),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::SharedObject,
            ..Args::default()
        },
    )
    .unwrap();

    let relas = parse_relas(&section(&out, ".rela.dyn").bytes);
    assert_eq!(relas.len(), 1);
    let (r_offset, r_sym, r_type, addend) = relas[0];
    assert_eq!(r_type, object::elf::R_PPC_RELATIVE);
    assert_eq!(r_sym, 0);
    let data = section(&out, ".data");
    assert_eq!(u64::from(r_offset), data.address);
    assert_eq!(addend as u32 as u64, data.address);
    // No record ever names the hidden symbol.
    assert_eq!(summary(&out, "hidden_sym").dynamic_relocations, 0);
    // The pc-relative word resolved at link time.
    assert_eq!(word_at(&data.bytes, 4), 0u32.wrapping_sub(4));
    assert_parity(&out);
}

#[test]
fn in_range_branch_needs_no_trampoline() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let target = obj.add_symbol(InputSymbol {
        value: 8,
        ..InputSymbol {
            binding: SymbolBinding::Local,
            ..global("target", SymbolKind::Function, SymbolPlacement::Section(0))
        }
    });
    obj.add_section(
        InputSection::progbits(
            ".text",
            exec_flags(),
            be_words(&[insn::bl(0), insn::NOP, insn::BLR]),
        )
        .with_relocations(vec![InputRelocation {
            offset: 0,
            r_type: object::elf::R_PPC_REL24,
            symbol: target,
            addend: 0,
        }]),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::StaticExecutable,
            ..Args::default()
        },
    )
    .unwrap();
    assert_eq!(out.stats.trampolines, 0);
    let text = section(&out, ".text");
    assert_eq!(word_at(&text.bytes, 0), insn::bl(8));
    assert_parity(&out);
}

#[test]
fn out_of_range_branches_share_one_trampoline_per_target() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    // An absolute entry point far beyond the 26-bit branch range from the
    // default base address.
    let far = obj.add_symbol(InputSymbol {
        value: 0x0400_0000,
        ..global("far", SymbolKind::Function, SymbolPlacement::Absolute)
    });
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::bl(0), insn::bl(0)]))
            .with_relocations(vec![
                InputRelocation {
                    offset: 0,
                    r_type: object::elf::R_PPC_REL24,
                    symbol: far,
                    addend: 0,
                },
                InputRelocation {
                    offset: 4,
                    r_type: object::elf::R_PPC_REL24,
                    symbol: far,
                    addend: 0,
                },
            ]),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::StaticExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    assert_eq!(out.stats.trampolines, 1);
    assert!(out.warnings.is_empty(), "warnings: {:?}", out.warnings);
    let text = section(&out, ".text");
    assert_eq!(text.mem_size, 8 + 16);
    // Both branches redirect into the island at the tail.
    assert_eq!(word_at(&text.bytes, 0), insn::bl(8));
    assert_eq!(word_at(&text.bytes, 4), insn::bl(4));
    assert_eq!(word_at(&text.bytes, 8), insn::lis(11, 0x0400));
    assert_eq!(word_at(&text.bytes, 12), insn::addi(11, 11, 0));
    assert_eq!(word_at(&text.bytes, 16), insn::mtctr(11));
    assert_eq!(word_at(&text.bytes, 20), insn::BCTR);
    assert_parity(&out);
}

#[test]
fn got_size_matches_slot_count() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let gvar = obj.add_symbol(InputSymbol {
        size: 4,
        ..global("gvar", SymbolKind::Object, SymbolPlacement::Section(1))
    });
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::lwz(3, 30, 0)]))
            .with_relocations(vec![InputRelocation {
                offset: 2,
                r_type: object::elf::R_PPC_GOT16,
                symbol: gvar,
                addend: 0,
            }]),
    );
    obj.add_section(InputSection::progbits(".data", data_flags(), vec![0; 4]));

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    assert_eq!(out.stats.got_slots, 1);
    assert_eq!(out.stats.got_size, 12 + 4 * out.stats.got_slots);
    // The slot precedes the header, so its offset from the GOT pointer is
    // negative.
    let text = section(&out, ".text");
    assert_eq!(word_at(&text.bytes, 0), insn::lwz(3, 30, 0xfffc));
    // A locally resolved slot needs no loader fix-up in a fixed-address
    // executable.
    assert!(maybe_section(&out, ".rela.dyn").is_none());
    assert_parity(&out);
}

#[test]
fn readonly_reference_to_shared_data_uses_copy_relocation() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let shared_var = obj.add_symbol(InputSymbol {
        size: 8,
        ..global("shared_var", SymbolKind::Object, SymbolPlacement::Undefined)
    });
    obj.add_section(
        InputSection::progbits(".rodata", ro_flags(), vec![0; 4]).with_relocations(vec![
            InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_ADDR32,
                symbol: shared_var,
                addend: 0,
            },
        ]),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    let dynbss = section(&out, ".dynbss");
    assert_eq!(dynbss.mem_size, 8);
    let relas = parse_relas(&section(&out, ".rela.dyn").bytes);
    assert_eq!(relas.len(), 1);
    assert_eq!(relas[0].2, object::elf::R_PPC_COPY);
    assert_eq!(u64::from(relas[0].0), dynbss.address);
    // The read-only word binds to the shadow copy.
    let rodata = section(&out, ".rodata");
    assert_eq!(u64::from(word_at(&rodata.bytes, 0)), dynbss.address);
    assert_eq!(out.layout.dynamic_symbols, vec!["shared_var".to_owned()]);
    assert_parity(&out);
}

#[test]
fn old_style_plt_calls_force_the_legacy_scheme() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let callee = obj.add_symbol(undefined_function("callee"));
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::bl(0)])).with_relocations(
            vec![InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_PLTREL24,
                symbol: callee,
                addend: 0,
            }],
        ),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    // Loader-patched slots: reserved header plus one 8-byte slot, and no
    // stub section at all.
    assert_eq!(section(&out, ".plt").mem_size, 72 + 8);
    assert!(maybe_section(&out, ".glink").is_none());
    assert_eq!(out.stats.call_stubs, 0);
    let relas = parse_relas(&section(&out, ".rela.plt").bytes);
    assert_eq!(relas.len(), 1);
    assert_eq!(relas[0].2, object::elf::R_PPC_JMP_SLOT);
    assert_parity(&out);
}

#[test]
fn modern_marker_relocations_keep_the_secure_scheme() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let here = obj.add_symbol(InputSymbol {
        binding: SymbolBinding::Local,
        ..global("here", SymbolKind::None, SymbolPlacement::Section(0))
    });
    let callee = obj.add_symbol(undefined_function("callee"));
    obj.add_section(
        InputSection::progbits(
            ".text",
            exec_flags(),
            be_words(&[insn::bl(0), insn::addis(30, 0, 0)]),
        )
        .with_relocations(vec![
            InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_PLTREL24,
                symbol: callee,
                addend: 0,
            },
            InputRelocation {
                offset: 6,
                r_type: object::elf::R_PPC_REL16_HA,
                symbol: here,
                addend: 0,
            },
        ]),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::DynamicExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    assert_eq!(section(&out, ".plt").mem_size, 8 + 4);
    assert_eq!(section(&out, ".glink").mem_size, 16 + 4 + 64);
    assert_eq!(out.stats.call_stubs, 1);
    assert_parity(&out);
}

#[test]
fn page_boundary_instruction_is_relocated() {
    init_logging();
    let words = 0x1004 / 4;
    let mut obj = InputObject::new("a.o");
    obj.add_section(InputSection::progbits(
        ".text",
        exec_flags(),
        be_words(&vec![insn::NOP; words]),
    ));

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::StaticExecutable,
            prefetch_workaround: true,
            ..Args::default()
        },
    )
    .unwrap();

    assert_eq!(out.stats.prefetch_patches, 1);
    let text = section(&out, ".text");
    assert_eq!(text.mem_size, 0x1004 + 8);
    // The word ending the first page became a branch to the patch area...
    assert_eq!(word_at(&text.bytes, 0xffc), insn::b(8));
    // ...which holds the displaced instruction and a branch back.
    assert_eq!(word_at(&text.bytes, 0x1004), insn::NOP);
    assert_eq!(word_at(&text.bytes, 0x1008), insn::b(-8));
    assert_parity(&out);
}

#[test]
fn position_independent_output_emits_relative_records_after_relaxation() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let anchor = obj.add_symbol(InputSymbol {
        binding: SymbolBinding::Local,
        ..global("anchor", SymbolKind::Object, SymbolPlacement::Section(1))
    });
    let far = obj.add_symbol(InputSymbol {
        value: 0x0400_0000,
        ..global("far", SymbolKind::Function, SymbolPlacement::Absolute)
    });
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::bl(0)])).with_relocations(
            vec![InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_REL24,
                symbol: far,
                addend: 0,
            }],
        ),
    );
    obj.add_section(
        InputSection::progbits(".data", data_flags(), vec![0; 4]).with_relocations(vec![
            InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_ADDR32,
                symbol: anchor,
                addend: 0,
            },
        ]),
    );

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::PositionIndependentExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    assert_eq!(out.stats.trampolines, 1);
    let relas = parse_relas(&section(&out, ".rela.dyn").bytes);
    assert_eq!(relas.len(), 1);
    assert_eq!(relas[0].2, object::elf::R_PPC_RELATIVE);
    assert_parity(&out);
}

#[test]
fn high_adjusted_pair_carries_the_sign_bit() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let var = obj.add_symbol(InputSymbol {
        value: 0x8ff8,
        size: 4,
        ..global("var", SymbolKind::Object, SymbolPlacement::Section(1))
    });
    obj.add_section(
        InputSection::progbits(
            ".text",
            exec_flags(),
            be_words(&[insn::lis(9, 0), insn::addi(9, 9, 0)]),
        )
        .with_relocations(vec![
            InputRelocation {
                offset: 2,
                r_type: object::elf::R_PPC_ADDR16_HA,
                symbol: var,
                addend: 0,
            },
            InputRelocation {
                offset: 6,
                r_type: object::elf::R_PPC_ADDR16_LO,
                symbol: var,
                addend: 0,
            },
        ]),
    );
    obj.add_section(InputSection::progbits(".data", data_flags(), vec![0; 0x9000]));

    let out = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::StaticExecutable,
            ..Args::default()
        },
    )
    .unwrap();

    let data_address = section(&out, ".data").address as u32;
    let target = data_address + 0x8ff8;
    assert!(target & 0x8000 != 0, "test requires a low half with bit 15 set");
    let text = section(&out, ".text");
    // The high half is bumped by one so the sign-extended low half lands on
    // the exact address.
    assert_eq!(
        word_at(&text.bytes, 0),
        insn::lis(9, target.wrapping_add(0x8000) >> 16)
    );
    assert_eq!(word_at(&text.bytes, 4), insn::addi(9, 9, target & 0xffff));
    let reconstructed = ((target.wrapping_add(0x8000) >> 16) << 16)
        .wrapping_add((target & 0xffff) as u16 as i16 as u32);
    assert_eq!(reconstructed, target);
    assert_parity(&out);
}

#[test]
fn unknown_relocation_type_is_fatal() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let sym = obj.add_symbol(undefined_function("f"));
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::NOP])).with_relocations(
            vec![InputRelocation {
                offset: 0,
                r_type: 0x7777,
                symbol: sym,
                addend: 0,
            }],
        ),
    );
    let err = libwren::link(&[obj], Args::default()).unwrap_err();
    assert!(format!("{err:#}").contains("Unsupported relocation type"));
}

#[test]
fn plt_call_against_local_symbol_is_fatal() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let local = obj.add_symbol(InputSymbol {
        binding: SymbolBinding::Local,
        ..global("local_fn", SymbolKind::Function, SymbolPlacement::Section(0))
    });
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::bl(0)])).with_relocations(
            vec![InputRelocation {
                offset: 0,
                r_type: object::elf::R_PPC_PLTREL24,
                symbol: local,
                addend: 0,
            }],
        ),
    );
    let err = libwren::link(&[obj], Args::default()).unwrap_err();
    assert!(format!("{err:#}").contains("no global visibility"));
}

#[test]
fn thread_pointer_immediates_are_rejected_in_shared_output() {
    init_logging();
    let mut obj = InputObject::new("a.o");
    let tvar = obj.add_symbol(InputSymbol {
        size: 4,
        ..global("tvar", SymbolKind::Tls, SymbolPlacement::Section(1))
    });
    obj.add_section(
        InputSection::progbits(".text", exec_flags(), be_words(&[insn::addi(3, 2, 0)]))
            .with_relocations(vec![InputRelocation {
                offset: 2,
                r_type: object::elf::R_PPC_TPREL16,
                symbol: tvar,
                addend: 0,
            }]),
    );
    obj.add_section(InputSection::progbits(".tdata", tls_flags(), vec![0; 4]));

    let err = libwren::link(
        &[obj],
        Args {
            output_kind: OutputKind::SharedObject,
            ..Args::default()
        },
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("shared object"));
}

#[test]
fn undefined_strong_symbol_fails_static_links() {
    init_logging();
    let inputs = [caller_object("a.o")];
    let err = libwren::link(
        &inputs,
        Args {
            output_kind: OutputKind::StaticExecutable,
            ..Args::default()
        },
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("Undefined symbol"));
}
