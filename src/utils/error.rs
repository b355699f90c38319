//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for Flease.
///
/// Protocol failures (quorum unreachable, overruled proposals, invalid
/// configuration, ...) are all carried as a `FleaseError` to the affected
/// caller's future or to the status listener.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FleaseError(String);

impl FleaseError {
    pub fn msg(msg: impl ToString) -> Self {
        FleaseError(msg.to_string())
    }

    /// Appends a debug description (e.g., of the proposer cell state) to the
    /// error message.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        FleaseError(format!("{} [{}]", self.0, ctx))
    }
}

impl fmt::Display for FleaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for FleaseError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `FleaseError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for FleaseError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                FleaseError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `FleaseError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for FleaseError {
            fn from(e: $error) -> FleaseError {
                FleaseError::msg(e.to_string())
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
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = FleaseError("quorum unreachable".into());
        assert_eq!(format!("{}", e), String::from("quorum unreachable"));
    }

    #[test]
    fn error_with_context() {
        let e = FleaseError::msg("did not receive enough responses")
            .with_context("cell c0 WAIT_FOR_PREP_ACK");
        assert_eq!(
            e.to_string(),
            "did not receive enough responses [cell c0 WAIT_FOR_PREP_ACK]"
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = FleaseError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
