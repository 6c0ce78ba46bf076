//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;
use std::sync;

/// Customized error type for partgrid.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GridError(pub(crate) String);

impl GridError {
    pub fn msg(msg: impl ToString) -> Self {
        GridError(msg.to_string())
    }

    /// Returns the carried message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for GridError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `GridError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GridError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                GridError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `GridError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for GridError {
            fn from(e: $error) -> GridError {
                GridError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl_from_error_generic!(sync::PoisonError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = GridError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = GridError::from(io_error);
        assert!(e.message().contains("oh no!"));
    }

    #[test]
    fn from_send_error() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        drop(rx);
        let e = GridError::from(tx.send(7).unwrap_err());
        assert!(e.message().contains("closed"));
    }
}
