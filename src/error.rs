use std::io;

use thiserror::Error;

/// Result type returned by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the synchronization façades.
///
/// Every operation reports its own failure through this value; there is no
/// shared "last error" slot to consult afterwards.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle was already destroyed.
    #[error("invalid handle: {0} has been destroyed")]
    InvalidHandle(&'static str),

    /// The OS could not allocate the native object.
    #[error("out of resources while creating {0}")]
    ResourceExhausted(&'static str),

    /// A native call reported an error.
    #[error("{call} failed: {source}")]
    Native {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// A documented precondition was violated by the caller.
    #[error("misuse: {0}")]
    Misuse(#[from] Misuse),

    /// An argument is outside the range the backend supports.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Posting would push the semaphore count past its maximum.
    #[error("semaphore count overflow")]
    Overflow,
}

/// Precondition violations detected before the native call is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misuse {
    #[error("mutex is not held by the calling thread")]
    NotOwner,
    #[error("mutex is already held by the calling thread")]
    Relock,
    #[error("condition variable is already paired with a different mutex")]
    MixedMutex,
    #[error("{0} is still in use")]
    Busy(&'static str),
}

impl Error {
    /// Whether this error was caused by violating a documented precondition.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::Misuse(_))
    }

    pub(crate) fn native(call: &'static str, code: i32) -> Error {
        Error::Native { call, source: io::Error::from_raw_os_error(code) }
    }

    pub(crate) fn last_native(call: &'static str) -> Error {
        Error::Native { call, source: io::Error::last_os_error() }
    }

    /// Classifies a failed native creation call.
    pub(crate) fn creation(what: &'static str, call: &'static str, code: i32) -> Error {
        match code {
            libc::ENOMEM | libc::EAGAIN => Error::ResourceExhausted(what),
            _ => Error::native(call, code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Misuse};

    #[test]
    fn creation_errors_classify_exhaustion() {
        assert!(matches!(
            Error::creation("mutex", "pthread_mutex_init", libc::ENOMEM),
            Error::ResourceExhausted("mutex")
        ));
        assert!(matches!(
            Error::creation("mutex", "pthread_mutex_init", libc::EINVAL),
            Error::Native { call: "pthread_mutex_init", .. }
        ));
    }

    #[test]
    fn misuse_is_flagged() {
        let e: Error = Misuse::NotOwner.into();
        assert!(e.is_misuse());
        assert!(!Error::Overflow.is_misuse());
        assert_eq!(e.to_string(), "misuse: mutex is not held by the calling thread");
    }
}
