//! Types shared between the relaxation engine and the relocation applier.

/// Tells the applier what to do with the relocation following the current
/// one. A rewritten TLS sequence consumes its paired marker relocation, so
/// the rewrite returns `SkipNext` to stop the marker being applied on top of
/// the new instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RelocationModifier {
    #[default]
    Normal,
    SkipNextRelocation,
}

impl RelocationModifier {
    #[must_use]
    pub fn skips_next(self) -> bool {
        self == RelocationModifier::SkipNextRelocation
    }
}
