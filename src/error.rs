//! The error surface shared by every layer of the inspector.

use std::io;

use thiserror::Error;

use crate::address::Address;

/// Everything a command or parser can fail with.
///
/// Faults inside parsers are skipped at entry/slot granularity and never
/// surface as an `Error`; anything that does reach the caller aborts that
/// one operation and leaves the storage snapshot untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// A command ran with no live target attached.
    #[error("no process is attached")]
    NotAttached,

    /// A remote read failed or a pointer validation rejected a candidate.
    #[error("failed to read {len} bytes at {address} while resolving {field}")]
    ReadFault {
        address: Address,
        len: usize,
        /// What was being resolved when the read failed.
        field: &'static str,
        #[source]
        source: Option<io::Error>,
    },

    /// A prerequisite latch has not been initialized yet.
    #[error("{component} is not ready")]
    NotReady { component: &'static str },

    /// The object, name id, or package does not exist.
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    /// A structural invariant of parsed data was violated.
    #[error("corrupt layout in {location}")]
    CorruptLayout { location: &'static str },

    /// The target's UE major version has no layout profile and fallback
    /// was refused.
    #[error("unsupported UE version {major}")]
    UnsupportedVersion { major: u32 },

    /// The command was cancelled between reads.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn read_fault(address: Address, len: usize, field: &'static str) -> Self {
        Self::ReadFault {
            address,
            len,
            field,
            source: None,
        }
    }

    /// Re-labels a `ReadFault` with the field a query was resolving when
    /// the read failed. Other variants pass through untouched.
    pub(crate) fn while_resolving(self, field: &'static str) -> Self {
        match self {
            Self::ReadFault {
                address,
                len,
                source,
                ..
            } => Self::ReadFault {
                address,
                len,
                field,
                source,
            },
            other => other,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
