//! Errors raised while bringing a counter set online.

use std::error::Error;
use std::fmt;
use std::io;

use ringside::MapError;

/// Failure to open or wire up part of a counter set.
///
/// Failures during [`open`] are per counter: one counter failing to open
/// does not tear down its siblings, and the per-counter errors come back
/// in the open report. The variants here also cover the set-level
/// conditions that abort the whole call.
///
/// [`open`]: crate::EventMux::open
#[derive(Debug)]
pub enum OpenError {
    /// The set was already opened; registration and open are one-shot.
    AlreadyOpen,
    /// Open was called with no counters registered.
    NoCounters,
    /// The event syscall or an fd-level ioctl failed for this counter.
    Event { name: String, source: io::Error },
    /// A ring mapping could not be established.
    Ring { source: MapError },
    /// Redirecting this counter's output into the shared ring failed.
    Redirect { name: String, source: io::Error },
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::AlreadyOpen => write!(f, "counter set is already open"),
            OpenError::NoCounters => write!(f, "no counters registered"),
            OpenError::Event { name, source } => {
                write!(f, "opening counter `{}` failed: {}", name, source)
            }
            OpenError::Ring { source } => write!(f, "ring mapping failed: {}", source),
            OpenError::Redirect { name, source } => {
                write!(f, "redirecting `{}` into the shared ring failed: {}", name, source)
            }
        }
    }
}

impl Error for OpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OpenError::Event { source, .. } | OpenError::Redirect { source, .. } => Some(source),
            OpenError::Ring { source } => Some(source),
            OpenError::AlreadyOpen | OpenError::NoCounters => None,
        }
    }
}
