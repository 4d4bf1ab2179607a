//! Error types shared by the mapping, reader, and decoding layers.
//!
//! Errors are split by the resource they poison: a [`MapError`] means no
//! mapping exists, a [`DecodeError`] means the affected byte stream can no
//! longer be trusted (the consumer cursor cannot be resynchronized once a
//! record size is wrong), and a [`SelfReadError`] concerns only the
//! counter value fast path, which is retryable unless the control page
//! itself reports an unusable state.

use std::error::Error;
use std::fmt;
use std::io;

/// Failure to establish or validate a ring-buffer mapping.
#[derive(Debug)]
pub enum MapError {
    /// The requested data region size was not zero or a power of two pages.
    BadPageCount(usize),
    /// The kernel rejected the mmap request.
    Os(io::Error),
    /// The mapped control page declares a layout revision this crate does
    /// not understand.
    UnsupportedVersion(u32),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::BadPageCount(n) => {
                write!(f, "data region must span 0 or a power of two pages, got {}", n)
            }
            MapError::Os(e) => write!(f, "mmap of perf event fd failed: {}", e),
            MapError::UnsupportedVersion(v) => {
                write!(f, "control page declares unsupported compat version {}", v)
            }
        }
    }
}

impl Error for MapError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MapError::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MapError {
    fn from(e: io::Error) -> MapError {
        MapError::Os(e)
    }
}

/// A malformed record was encountered in a ring buffer or record body.
///
/// Record sizes come from the producer; once one is inconsistent the
/// consumer has no way to find the next record boundary, so a decode error
/// is fatal for the stream that produced it. Errors from parsing a single
/// record body taint only interpretation, but callers that keep consuming
/// after one should treat field values with suspicion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The producer head claims more unconsumed bytes than the ring holds.
    HeadBeyondRing { available: u64, ring: usize },
    /// Fewer bytes than a record header were pending between tail and head.
    TruncatedHeader { available: u64 },
    /// A record header declared a size smaller than the header itself.
    SizeTooSmall { declared: u16 },
    /// A record header declared a size extending past the producer head.
    SizeBeyondHead { declared: u16, available: u64 },
    /// A record body ended before a field the event layout requires.
    ShortBody { kind: u32, needed: usize, len: usize },
    /// An embedded length field points past the end of the record body.
    BadLength { kind: u32, declared: usize, len: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::HeadBeyondRing { available, ring } => write!(
                f,
                "producer head claims {} unconsumed bytes in a {}-byte ring",
                available, ring
            ),
            DecodeError::TruncatedHeader { available } => {
                write!(f, "{} pending bytes cannot hold a record header", available)
            }
            DecodeError::SizeTooSmall { declared } => {
                write!(f, "record header declares impossible size {}", declared)
            }
            DecodeError::SizeBeyondHead { declared, available } => write!(
                f,
                "record size {} exceeds the {} bytes published by the producer",
                declared, available
            ),
            DecodeError::ShortBody { kind, needed, len } => write!(
                f,
                "record type {} needs {} body bytes, got {}",
                kind, needed, len
            ),
            DecodeError::BadLength { kind, declared, len } => write!(
                f,
                "record type {} embeds length {} but only {} bytes follow",
                kind, declared, len
            ),
        }
    }
}

impl Error for DecodeError {}

/// Failure of the syscall-free counter read path.
#[derive(Debug)]
pub enum SelfReadError {
    /// The control page does not grant userspace access to the counter
    /// register, so values cannot be read without a syscall.
    NoUserRead,
    /// Self-reads need direct counter register access, which this build
    /// target does not provide.
    Unsupported,
    /// The sequence lock never settled; the producer side is wedged or the
    /// page memory is corrupt.
    PageInconsistent { retries: u32 },
}

impl fmt::Display for SelfReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfReadError::NoUserRead => {
                write!(f, "control page denies userspace counter register access")
            }
            SelfReadError::Unsupported => {
                write!(f, "direct counter register reads are not available on this target")
            }
            SelfReadError::PageInconsistent { retries } => write!(
                f,
                "control page sequence count never stabilized after {} reads",
                retries
            ),
        }
    }
}

impl Error for SelfReadError {}
