//! The crate-wide error type.
//!
//! One enum, generic over the underlying flash driver's error type, in the
//! same shape as the teacher's `Error<IO::Error>` (see `transaction.rs` in
//! `fatrs`): every fallible operation in this crate returns `Result<T,
//! Error<F::Error>>` so callers get one error type to match on regardless of
//! which layer (codec, index, sector table, flash) actually produced it.

use core::fmt;

use flashkv_flash::FlashError;

/// Errors produced by [`crate::Kvs`] operations.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// Caller violated a documented precondition: zero-length or oversize
    /// key, oversize value, non-aligned flash address.
    InvalidArgument,
    /// Key not present, or present only in the `deleted` state.
    NotFound,
    /// No sector could be allocated even after garbage collection, or the
    /// key/sector index is full.
    ResourceExhausted,
    /// A checksum or magic mismatch was encountered where integrity was
    /// required.
    DataLoss,
    /// The flash driver reported a hardware-level failure. The current
    /// operation was aborted without mutating the in-RAM index.
    Unknown(E),
    /// An invariant was violated that should be unreachable under any
    /// input; indicates a bug, or (for transaction ids) approaching the
    /// 32-bit wrap point with wrap-handling not enabled.
    Internal,
}

impl<E> From<FlashError<E>> for Error<E> {
    fn from(e: FlashError<E>) -> Self {
        match e {
            FlashError::InvalidArgument => Error::InvalidArgument,
            FlashError::Unknown(inner) => Error::Unknown(inner),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "key not found"),
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::DataLoss => write!(f, "checksum or magic mismatch"),
            Error::Unknown(e) => write!(f, "flash driver error: {e:?}"),
            Error::Internal => write!(f, "internal invariant violation"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for Error<E> {}
