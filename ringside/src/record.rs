//! Record framing and the typed record set.
//!
//! Every entry in a ring buffer starts with the same 8-byte header: a
//! record type, a `misc` flag word, and the total size including the
//! header. The size is the only framing there is, so it is validated
//! against the producer head before a body is ever copied out.

use crate::errors::DecodeError;
use crate::sample::{EventLayout, Sample};
use crate::wire::{zero_padded_str, Cursor};

/// Record type values from the producer ABI.
pub mod kind {
    use perf_event_open_sys::bindings as sys;

    pub const MMAP: u32 = sys::PERF_RECORD_MMAP as u32;
    pub const LOST: u32 = sys::PERF_RECORD_LOST as u32;
    pub const COMM: u32 = sys::PERF_RECORD_COMM as u32;
    pub const EXIT: u32 = sys::PERF_RECORD_EXIT as u32;
    pub const THROTTLE: u32 = sys::PERF_RECORD_THROTTLE as u32;
    pub const UNTHROTTLE: u32 = sys::PERF_RECORD_UNTHROTTLE as u32;
    pub const FORK: u32 = sys::PERF_RECORD_FORK as u32;
    pub const READ: u32 = sys::PERF_RECORD_READ as u32;
    pub const SAMPLE: u32 = sys::PERF_RECORD_SAMPLE as u32;
}

/// Size of the fixed header preceding every record body.
pub const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    /// Total record size, header included. Always a multiple of 8 from a
    /// well-behaved producer, but nothing here relies on that.
    pub size: u16,
}

impl RecordHeader {
    pub fn parse(bytes: [u8; RECORD_HEADER_SIZE]) -> RecordHeader {
        RecordHeader {
            kind: u32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            misc: u16::from_ne_bytes(bytes[4..6].try_into().unwrap()),
            size: u16::from_ne_bytes(bytes[6..8].try_into().unwrap()),
        }
    }
}

/// One record copied out of a ring buffer, body not yet interpreted.
///
/// The copy is linear even when the record wrapped around the ring edge,
/// and the ring space it occupied has already been returned to the
/// producer by the time the record is handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub header: RecordHeader,
    /// Record body, header stripped.
    pub body: Vec<u8>,
}

impl RawRecord {
    /// Interprets the body according to the event configuration that
    /// produced it.
    pub fn decode(&self, layout: &EventLayout) -> Result<Record, DecodeError> {
        decode_body(self.header.kind, &self.body, layout)
    }
}

/// An mmap of an executable region in the monitored process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapRecord {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub path: String,
}

/// Records dropped by the producer for one event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
}

/// A change of the monitored task's command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub name: String,
}

/// Task fork or exit. The same body layout serves both record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}

/// Event throttling state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
}

/// An asynchronous counter readout. The value block depends on the
/// event's read format and is left for the caller to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub pid: u32,
    pub tid: u32,
    pub values: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Mmap(MmapRecord),
    Lost(LostRecord),
    Comm(CommRecord),
    Exit(TaskRecord),
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
    Fork(TaskRecord),
    Read(ReadRecord),
    Sample(Sample),
    /// A record type this crate does not know. The body is preserved
    /// byte for byte so callers can interpret newer types themselves.
    Unknown { kind: u32, body: Vec<u8> },
}

fn decode_body(kind: u32, body: &[u8], layout: &EventLayout) -> Result<Record, DecodeError> {
    if kind == kind::SAMPLE {
        return Ok(Record::Sample(layout.parse_sample(body)?));
    }

    let known = matches!(
        kind,
        kind::MMAP
            | kind::LOST
            | kind::COMM
            | kind::EXIT
            | kind::FORK
            | kind::THROTTLE
            | kind::UNTHROTTLE
            | kind::READ
    );
    if !known {
        return Ok(Record::Unknown { kind, body: body.to_vec() });
    }

    // Every non-sample record carries the id trailer at the end of its
    // body when the event asked for it; the typed fields stop before it.
    let trailer = layout.trailer_len();
    let typed = match body.len().checked_sub(trailer) {
        Some(n) => &body[..n],
        None => {
            return Err(DecodeError::ShortBody { kind, needed: trailer, len: body.len() })
        }
    };
    let mut c = Cursor::new(kind, typed);

    let record = match kind {
        kind::MMAP => Record::Mmap(MmapRecord {
            pid: c.u32()?,
            tid: c.u32()?,
            addr: c.u64()?,
            len: c.u64()?,
            pgoff: c.u64()?,
            path: zero_padded_str(c.rest()),
        }),
        kind::LOST => Record::Lost(LostRecord { id: c.u64()?, lost: c.u64()? }),
        kind::COMM => Record::Comm(CommRecord {
            pid: c.u32()?,
            tid: c.u32()?,
            name: zero_padded_str(c.rest()),
        }),
        kind::EXIT | kind::FORK => {
            let task = TaskRecord {
                pid: c.u32()?,
                ppid: c.u32()?,
                tid: c.u32()?,
                ptid: c.u32()?,
                time: c.u64()?,
            };
            if kind == kind::EXIT {
                Record::Exit(task)
            } else {
                Record::Fork(task)
            }
        }
        kind::THROTTLE | kind::UNTHROTTLE => {
            let throttle =
                ThrottleRecord { time: c.u64()?, id: c.u64()?, stream_id: c.u64()? };
            if kind == kind::THROTTLE {
                Record::Throttle(throttle)
            } else {
                Record::Unthrottle(throttle)
            }
        }
        kind::READ => Record::Read(ReadRecord {
            pid: c.u32()?,
            tid: c.u32()?,
            values: c.rest().to_vec(),
        }),
        _ => Record::Unknown { kind, body: body.to_vec() },
    };
    Ok(record)
}
