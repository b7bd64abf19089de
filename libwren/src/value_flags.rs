//! Per-symbol flags accumulated by the scanner and refined by the planner.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub(crate) struct ValueFlags: u16 {
        /// The symbol's address is taken or stored directly, outside the GOT.
        const DIRECT = 1 << 0;
        /// At least one reference goes through a GOT slot.
        const GOT = 1 << 1;
        /// At least one reference wants PLT indirection.
        const PLT = 1 << 2;
        /// The planner decided to materialize the symbol with a load-time
        /// copy in the output's writable data.
        const COPY_RELOCATION = 1 << 3;
        /// The symbol's value comes from outside this link and can be
        /// interposed or filled in by the runtime loader.
        const DYNAMIC = 1 << 4;
        /// Resolved through a runtime-selected implementation; always
        /// reached via the PLT.
        const IFUNC = 1 << 5;
        const FUNCTION = 1 << 6;
        const ABSOLUTE = 1 << 7;
        /// The planner chose to rewrite direct high/low address formation
        /// into an indirect GOT load.
        const GOT_INDIRECT_REWRITE = 1 << 8;
        /// Some direct reference lives in a read-only section, which rules
        /// out leaving a dynamic relocation there when a copy is possible.
        const RO_DIRECT_REF = 1 << 9;
    }
}

impl ValueFlags {
    pub(crate) fn needs_plt(self) -> bool {
        self.contains(ValueFlags::PLT)
    }

    pub(crate) fn needs_direct(self) -> bool {
        self.contains(ValueFlags::DIRECT)
    }

    pub(crate) fn is_ifunc(self) -> bool {
        self.contains(ValueFlags::IFUNC)
    }

    pub(crate) fn is_function(self) -> bool {
        self.contains(ValueFlags::FUNCTION)
    }

    pub(crate) fn needs_copy_relocation(self) -> bool {
        self.contains(ValueFlags::COPY_RELOCATION)
    }

    pub(crate) fn merge(&mut self, other: ValueFlags) {
        *self |= other;
    }
}

impl std::fmt::Display for ValueFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}
