//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for StageFS.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StagefsError(pub String);

impl StagefsError {
    /// Creates an error from anything displayable.
    pub fn msg(m: impl fmt::Display) -> Self {
        StagefsError(m.to_string())
    }
}

impl fmt::Display for StagefsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for StagefsError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `StagefsError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for StagefsError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                StagefsError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(nix::errno::Errno);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StagefsError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StagefsError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = StagefsError("spill file ran dry".into());
        assert_eq!(format!("{}", e), String::from("spill file ran dry"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = StagefsError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
