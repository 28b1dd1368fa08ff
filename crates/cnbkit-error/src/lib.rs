//! Status codes and structured errors shared by every cnbkit crate.
//!
//! This crate defines the attribution model: a closed set of canonical
//! [`Status`] codes (where only [`Status::Internal`] blames the platform),
//! the [`BuildError`] carried through every failing operation, and the
//! deterministic short [`ErrorId`] support tooling uses to correlate
//! recurring failures across builds.

pub mod error;
pub mod id;
pub mod status;

pub use error::BuildError;
pub use id::{generate_error_id, ErrorId, ERROR_ID_LENGTH};
pub use status::{Status, UnknownStatus};

/// Build a [`BuildError`] with an explicit status from `format!` arguments.
#[macro_export]
macro_rules! build_error {
    ($status:expr, $($arg:tt)+) => {
        $crate::BuildError::new($status, format!($($arg)+))
    };
}

/// Build a platform-attributed ([`Status::Internal`]) [`BuildError`].
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)+) => {
        $crate::BuildError::internal(format!($($arg)+))
    };
}

/// Build a user-attributed ([`Status::Unknown`]) [`BuildError`].
#[macro_export]
macro_rules! user_error {
    ($($arg:tt)+) => {
        $crate::BuildError::user(format!($($arg)+))
    };
}
