//! Error types for xsync

use crate::driver::ZeResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// A driver entry point returned a failure code.
    #[error("{call} failed: {result}")]
    Driver { call: &'static str, result: ZeResult },

    /// A tagged invalid handle was passed where a live object was required.
    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    /// The current driver or device lacks a capability. Callers skip, not fail.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{operation} still not ready after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("event pool exhausted: all {capacity} slots in use")]
    PoolExhausted { capacity: u32 },

    #[error("event {0} is not tracked by this pool")]
    UnknownEvent(u64),

    #[error("data mismatch at offset {offset}: expected {expected:#04x}, got {actual:#04x}")]
    DataMismatch { offset: usize, expected: u8, actual: u8 },

    #[error("exchange protocol error: {0}")]
    Protocol(String),

    #[error("consumer process failed ({status}): {errors:?}")]
    ConsumerFailed { status: String, errors: Vec<String> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::Error),
}

impl Error {
    /// Build a driver failure for `call`.
    pub(crate) fn driver(call: &'static str, result: ZeResult) -> Self {
        Error::Driver { call, result }
    }

    /// True for the transient "not signaled yet" condition.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Error::Driver {
                result: ZeResult::NotReady,
                ..
            }
        )
    }

    /// True when the failure means "feature absent" and the caller should skip.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Error::Unsupported(_)
                | Error::Driver {
                    result: ZeResult::UnsupportedFeature,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::driver("zeFenceHostSynchronize", ZeResult::NotReady).is_not_ready());
        assert!(!Error::driver("zeFenceHostSynchronize", ZeResult::InvalidArgument).is_not_ready());
        assert!(Error::Unsupported("mapped timestamps".into()).is_unsupported());
        assert!(Error::driver("zeEventPoolCreate", ZeResult::UnsupportedFeature).is_unsupported());
        assert!(!Error::PoolExhausted { capacity: 4 }.is_unsupported());
    }
}
