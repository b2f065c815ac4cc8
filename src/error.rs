//! Typed backend errors and the host-errno -> NBD-error mapping table.
//!
//! The teacher maps `std::io::ErrorKind` straight to an NBD error code at
//! the reply boundary; this crate's `Backend` trait is generalized to run
//! over things that aren't `std::fs::File` (in-memory buffers, future
//! network-backed images), so `BackendError` gives backends a small,
//! explicit errno vocabulary instead of overloading `io::ErrorKind`.
use thiserror::Error;

use crate::proto::ErrorType as NbdErrorCode;

/// Host-style errno, used by `Backend` implementations to report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Perm,
    Io,
    NoMem,
    Inval,
    NoSpc,
}

/// Error returned by `Backend` operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend error: {errno:?}: {message}")]
    Errno { errno: Errno, message: String },
}

impl BackendError {
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        BackendError::Errno { errno, message: message.into() }
    }

    pub fn errno(&self) -> Errno {
        match self {
            BackendError::Errno { errno, .. } => *errno,
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let errno = match e.kind() {
            PermissionDenied => Errno::Perm,
            OutOfMemory => Errno::NoMem,
            InvalidInput | InvalidData | UnexpectedEof => Errno::Inval,
            _ => Errno::Io,
        };
        BackendError::new(errno, e.to_string())
    }
}

/// Map a `BackendError` to the NBD wire error code (§4.A errno-mapping
/// table: `EPERM->1`, `EIO->5`, `ENOMEM->12`, `EINVAL->22`,
/// `ENOSPC/EFBIG/EDQUOT->28`, everything else -> `EINVAL`).
pub(crate) fn nbd_error_code(err: &BackendError) -> NbdErrorCode {
    match err.errno() {
        Errno::Perm => NbdErrorCode::EPerm,
        Errno::Io => NbdErrorCode::EIo,
        Errno::NoMem => NbdErrorCode::ENoMem,
        Errno::Inval => NbdErrorCode::EInval,
        Errno::NoSpc => NbdErrorCode::ENoSpc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_io_error_kind_falls_through_to_eio() {
        let e: BackendError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(nbd_error_code(&e), NbdErrorCode::EIo);
    }

    #[test]
    fn invalid_input_maps_to_einval() {
        let e: BackendError =
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad").into();
        assert_eq!(nbd_error_code(&e), NbdErrorCode::EInval);
    }
}
