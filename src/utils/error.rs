//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use crate::server::Generation;

/// Customized error type for QuorumKV.
///
/// The protocol-level variants mirror the failure classes a coordinator must
/// tell apart internally; the client only ever sees an opaque failure.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum QuorumKvError {
    /// Generic error carrying a message string.
    Msg(String),

    /// Fewer than a majority of replicas answered successfully.
    QuorumNotReached {
        needed: u8,
        acked: u8,
        cause: String,
    },

    /// A replica refused the request because its generation is stale.
    FencingRejected { current_generation: Generation },

    /// A synchronous read-repair write did not reach acknowledgement.
    ReadRepairFailed { key: String },

    /// A single peer call did not complete within its deadline.
    Timeout { waited_ms: u64 },
}

impl QuorumKvError {
    pub fn msg(msg: impl ToString) -> Self {
        QuorumKvError::Msg(msg.to_string())
    }
}

impl fmt::Display for QuorumKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Msg(msg) => write!(f, "{}", msg), // no literal quotes
            Self::QuorumNotReached {
                needed,
                acked,
                cause,
            } => write!(
                f,
                "quorum not reached: needed {} got {} ({})",
                needed, acked, cause
            ),
            Self::FencingRejected { current_generation } => write!(
                f,
                "rejected by fencing: already accepted generation {}",
                current_generation
            ),
            Self::ReadRepairFailed { key } => {
                write!(f, "read repair failed for key '{}'", key)
            }
            Self::Timeout { waited_ms } => {
                write!(f, "timed out after {} ms", waited_ms)
            }
        }
    }
}

impl error::Error for QuorumKvError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `QuorumKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for QuorumKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                QuorumKvError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `QuorumKvError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for QuorumKvError {
            fn from(e: $error) -> QuorumKvError {
                QuorumKvError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = QuorumKvError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn fencing_display() {
        let e = QuorumKvError::FencingRejected {
            current_generation: 2,
        };
        assert_eq!(
            format!("{}", e),
            "rejected by fencing: already accepted generation 2"
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = QuorumKvError::from(io_error);
        assert!(matches!(e, QuorumKvError::Msg(ref s) if s.contains("oh no!")));
    }
}
