//! The interface to the container object-file layer. The container reader
//! owns parsing; it hands the backend fully enumerated sections, symbols and
//! relocation lists in the form defined here.

use linker_utils::elf::SectionFlags;
use linker_utils::elf::shf;

pub struct InputObject {
    /// Display name used in diagnostics, usually the file path.
    pub name: String,
    pub sections: Vec<InputSection>,
    /// Local symbols first, then globals, mirroring the symbol table layout
    /// of the container format.
    pub symbols: Vec<InputSymbol>,
    pub num_local_symbols: usize,
}

pub struct InputSection {
    pub name: String,
    pub flags: SectionFlags,
    pub alignment: u32,
    /// Raw content. Empty for sections without file backing.
    pub data: Vec<u8>,
    /// True for BSS-style sections: `data` is empty and `mem_size` gives the
    /// memory footprint.
    pub is_bss: bool,
    pub mem_size: u32,
    pub relocations: Vec<InputRelocation>,
}

#[derive(Clone, Copy, Debug)]
pub struct InputRelocation {
    pub offset: u32,
    pub r_type: u32,
    /// Index into the owning object's symbol table.
    pub symbol: u32,
    pub addend: i32,
}

#[derive(Clone, Debug)]
pub struct InputSymbol {
    pub name: String,
    pub value: u32,
    pub size: u32,
    pub placement: SymbolPlacement,
    pub binding: SymbolBinding,
    pub kind: SymbolKind,
    pub visibility: Visibility,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolPlacement {
    /// Defined in the given section of its object.
    Section(usize),
    Absolute,
    Undefined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    None,
    Function,
    Object,
    Tls,
    IndirectFunction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Protected,
    Hidden,
    Internal,
}

impl Visibility {
    /// Hidden and internal symbols never get dynamic symbol table entries.
    #[must_use]
    pub fn is_local_only(self) -> bool {
        matches!(self, Visibility::Hidden | Visibility::Internal)
    }
}

/// Identifies a section across all input objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SectionRef {
    pub file: u32,
    pub section: u32,
}

impl SectionRef {
    pub(crate) fn new(file: usize, section: usize) -> SectionRef {
        SectionRef {
            file: file as u32,
            section: section as u32,
        }
    }
}

impl InputObject {
    pub fn new(name: &str) -> InputObject {
        InputObject {
            name: name.to_owned(),
            sections: Vec::new(),
            // Symbol index 0 is the null symbol, like in the container
            // format's symbol table.
            symbols: vec![InputSymbol {
                name: String::new(),
                value: 0,
                size: 0,
                placement: SymbolPlacement::Undefined,
                binding: SymbolBinding::Local,
                kind: SymbolKind::None,
                visibility: Visibility::Default,
            }],
            num_local_symbols: 1,
        }
    }

    pub fn add_section(&mut self, section: InputSection) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    /// Adds a symbol, keeping locals in front of globals. Returns its index.
    pub fn add_symbol(&mut self, symbol: InputSymbol) -> u32 {
        if symbol.binding == SymbolBinding::Local {
            assert_eq!(
                self.num_local_symbols,
                self.symbols.len(),
                "local symbols must be added before globals"
            );
            self.num_local_symbols += 1;
        }
        self.symbols.push(symbol);
        (self.symbols.len() - 1) as u32
    }

    pub(crate) fn section_index_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }
}

impl InputSection {
    pub fn progbits(name: &str, flags: SectionFlags, data: Vec<u8>) -> InputSection {
        let mem_size = data.len() as u32;
        InputSection {
            name: name.to_owned(),
            flags,
            alignment: 4,
            data,
            is_bss: false,
            mem_size,
            relocations: Vec::new(),
        }
    }

    pub fn nobits(name: &str, flags: SectionFlags, mem_size: u32) -> InputSection {
        InputSection {
            name: name.to_owned(),
            flags,
            alignment: 4,
            data: Vec::new(),
            is_bss: true,
            mem_size,
            relocations: Vec::new(),
        }
    }

    pub fn with_relocations(mut self, relocations: Vec<InputRelocation>) -> InputSection {
        self.relocations = relocations;
        self
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.flags.contains(shf::EXECINSTR)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.flags.contains(shf::WRITE)
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.flags.contains(shf::ALLOC)
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.flags.contains(shf::TLS)
    }
}
