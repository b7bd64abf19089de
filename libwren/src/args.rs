//! Link-wide options. Parsing command lines is the driver's job; this is the
//! already-digested form the backend works from.

#[derive(Clone, Debug)]
pub struct Args {
    pub output_kind: OutputKind,
    /// Whether to run the branch-reach relaxation pass.
    pub relax: bool,
    /// Runtime profiling support was requested. Incompatible with the secure
    /// PLT calling convention for position-independent output.
    pub profile: bool,
    /// Bind defined symbols within the output even when building a shared
    /// object (`-Bsymbolic`).
    pub bind_symbolically: bool,
    pub copy_relocations: CopyRelocations,
    /// Memory address given to the first output section.
    pub base_address: u32,
    /// Hardware page size used by the instruction-prefetch workaround.
    pub page_size: u32,
    /// Apply the instruction-prefetch erratum workaround.
    pub prefetch_workaround: bool,
    /// Driver-supplied symbol aliases (e.g. from a version script), applied
    /// before scanning: each `(alias, target)` makes `alias` an indirect
    /// symbol resolving to `target`.
    pub aliases: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyRelocations {
    Allowed,
    Disallowed(&'static str),
}

impl Default for Args {
    fn default() -> Args {
        Args {
            output_kind: OutputKind::DynamicExecutable,
            relax: true,
            profile: false,
            bind_symbolically: false,
            copy_relocations: CopyRelocations::Allowed,
            base_address: 0x0180_0000,
            page_size: 0x1000,
            prefetch_workaround: false,
            aliases: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    StaticExecutable,
    DynamicExecutable,
    PositionIndependentExecutable,
    SharedObject,
}

impl OutputKind {
    #[must_use]
    pub fn is_executable(self) -> bool {
        !matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_static_executable(self) -> bool {
        matches!(self, OutputKind::StaticExecutable)
    }

    #[must_use]
    pub fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }

    /// Whether the output can be loaded at an arbitrary base address, which
    /// is what forces link-time-unknown values into dynamic relocations.
    #[must_use]
    pub fn is_relocatable(self) -> bool {
        matches!(
            self,
            OutputKind::PositionIndependentExecutable | OutputKind::SharedObject
        )
    }

    /// Whether the output carries dynamic-linking metadata at all.
    #[must_use]
    pub fn needs_dynamic(self) -> bool {
        !self.is_static_executable()
    }
}
