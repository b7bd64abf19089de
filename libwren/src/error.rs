//! Error plumbing. We use anyhow's error type with a default-`()` result
//! alias so that fallible functions that only fail can be written as
//! `-> Result`.

pub use anyhow::Context;

pub type Error = anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Creates an [`Error`] from a format string.
#[macro_export]
macro_rules! error {
    ($($args:tt)*) => {
        $crate::error::Error::msg(format!($($args)*))
    };
}

#[macro_export]
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::error!($($args)*))
    };
}

#[macro_export]
macro_rules! ensure {
    ($condition:expr, $($args:tt)*) => {
        if !$condition {
            $crate::bail!($($args)*);
        }
    };
}

/// Like `debug_assert!`, except in release builds the failure becomes an
/// error return rather than being compiled out silently.
#[macro_export]
macro_rules! debug_assert_bail {
    ($condition:expr, $($args:tt)*) => {
        debug_assert!($condition, $($args)*);
        if !$condition {
            $crate::bail!($($args)*);
        }
    };
}

/// Reports a non-fatal diagnostic. Subscriber installation is the driver's
/// business; if nothing is installed this is a no-op.
pub(crate) fn warning(message: &str) {
    tracing::warn!(message);
}
