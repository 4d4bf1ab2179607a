//! Userspace consumption of Linux counter events.
//!
//! A monitored event exposes two surfaces to the process watching it,
//! both reached through one mmap over the event fd:
//!
//! * the **control page**, a kernel-updated header carrying counter
//!   state, time scaling factors, and the ring-buffer head and tail
//!   ([`page`], [`self_read`]),
//! * the **record ring**, a byte ring of size-framed records written by
//!   the kernel and drained by exactly one consumer ([`reader`],
//!   [`record`], [`sample`]).
//!
//! [`RingMapping`] establishes the mapping and owns both surfaces.
//! Counter values can then be read without a syscall via
//! [`RingMapping::self_reader`], and records stream out through
//! [`RingMapping::read_next`], to be interpreted against the producing
//! event's [`EventLayout`].
//!
//! What this crate deliberately does not do: configure or open events
//! (callers bring their own fds), or interpret sample fields it cannot
//! size, which are preserved as opaque bytes instead.

pub mod errors;
pub mod mapping;
pub mod page;
pub mod reader;
pub mod record;
pub mod sample;
pub mod self_read;

mod wire;

pub use crate::errors::{DecodeError, MapError, SelfReadError};
pub use crate::mapping::{MapConfig, RingMapping};
pub use crate::page::ControlPage;
pub use crate::reader::RingReader;
pub use crate::record::{RawRecord, Record, RecordHeader, RECORD_HEADER_SIZE};
pub use crate::sample::{EventLayout, Sample, SampleId};
pub use crate::self_read::SelfReader;
