//! Sample decoding driven by the event's field selection.
//!
//! A SAMPLE record body has no per-field framing: which fields are
//! present, and in what order, is fixed by the `sample_type` bits of the
//! event that produced it. The canonical field order does not follow bit
//! order (the identifier, when requested, always comes first so that
//! streams with differing layouts stay routable), so decoding walks an
//! explicit field sequence rather than the bits numerically.
//!
//! Events can also request the same identifying fields on every
//! non-sample record (`sample_id_all`); those arrive as a trailer at the
//! end of the record body, laid out back to front relative to the sample
//! field order.

use crate::errors::DecodeError;
use crate::record::kind;
use crate::wire::Cursor;

/// Field selection bits, one per sample field.
pub mod flag {
    use perf_event_open_sys::bindings as sys;

    pub const IP: u64 = sys::PERF_SAMPLE_IP as u64;
    pub const TID: u64 = sys::PERF_SAMPLE_TID as u64;
    pub const TIME: u64 = sys::PERF_SAMPLE_TIME as u64;
    pub const ADDR: u64 = sys::PERF_SAMPLE_ADDR as u64;
    pub const READ: u64 = sys::PERF_SAMPLE_READ as u64;
    pub const CALLCHAIN: u64 = sys::PERF_SAMPLE_CALLCHAIN as u64;
    pub const ID: u64 = sys::PERF_SAMPLE_ID as u64;
    pub const CPU: u64 = sys::PERF_SAMPLE_CPU as u64;
    pub const PERIOD: u64 = sys::PERF_SAMPLE_PERIOD as u64;
    pub const STREAM_ID: u64 = sys::PERF_SAMPLE_STREAM_ID as u64;
    pub const RAW: u64 = sys::PERF_SAMPLE_RAW as u64;
    pub const IDENTIFIER: u64 = sys::PERF_SAMPLE_IDENTIFIER as u64;
}

/// Field layout of records produced by one event configuration.
///
/// Holds the two attribute values that shape record bodies: the
/// `sample_type` bit set and whether non-sample records carry the id
/// trailer. A layout is only valid for records from events configured
/// with exactly these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLayout {
    sample_type: u64,
    sample_id_all: bool,
}

impl EventLayout {
    pub fn new(sample_type: u64, sample_id_all: bool) -> EventLayout {
        EventLayout { sample_type, sample_id_all }
    }

    pub fn sample_type(&self) -> u64 {
        self.sample_type
    }

    pub fn sample_id_all(&self) -> bool {
        self.sample_id_all
    }

    fn has(&self, flag: u64) -> bool {
        self.sample_type & flag != 0
    }

    /// Whether sample bodies carry an identifier usable for routing
    /// without knowing the rest of the layout (it is the first field).
    pub fn identifier_first(&self) -> bool {
        self.has(flag::IDENTIFIER)
    }

    /// Bytes the id trailer occupies at the end of every non-sample
    /// record body, or 0 when the event does not request it.
    pub fn trailer_len(&self) -> usize {
        if !self.sample_id_all {
            return 0;
        }
        const TRAILER_FLAGS: [u64; 6] = [
            flag::TID,
            flag::TIME,
            flag::ID,
            flag::STREAM_ID,
            flag::CPU,
            flag::IDENTIFIER,
        ];
        TRAILER_FLAGS.iter().filter(|&&f| self.has(f)).count() * 8
    }

    /// Fields between the fixed-size block and the raw blob that this
    /// crate cannot size. When one is requested, everything from its
    /// position on is an opaque tail.
    fn blocks_raw(&self) -> bool {
        self.has(flag::READ) || self.has(flag::CALLCHAIN)
    }

    /// Decodes a SAMPLE record body.
    ///
    /// Fields are walked in canonical order; each requested field fills
    /// its slot in the result. The walk stops interpreting at the first
    /// field whose size this crate does not know, and whatever follows is
    /// preserved in [`Sample::trailing`].
    pub fn parse_sample(&self, body: &[u8]) -> Result<Sample, DecodeError> {
        let mut c = Cursor::new(kind::SAMPLE, body);
        let mut sample = Sample::default();

        if self.has(flag::IDENTIFIER) {
            sample.identifier = Some(c.u64()?);
        }
        if self.has(flag::IP) {
            sample.ip = Some(c.u64()?);
        }
        if self.has(flag::TID) {
            sample.pid = Some(c.u32()?);
            sample.tid = Some(c.u32()?);
        }
        if self.has(flag::TIME) {
            sample.time = Some(c.u64()?);
        }
        if self.has(flag::ADDR) {
            sample.addr = Some(c.u64()?);
        }
        if self.has(flag::ID) {
            sample.id = Some(c.u64()?);
        }
        if self.has(flag::STREAM_ID) {
            sample.stream_id = Some(c.u64()?);
        }
        if self.has(flag::CPU) {
            sample.cpu = Some(c.u32()?);
            // Reserved half of the cpu slot.
            c.u32()?;
        }
        if self.has(flag::PERIOD) {
            sample.period = Some(c.u64()?);
        }

        if !self.blocks_raw() && self.has(flag::RAW) {
            sample.raw = Some(c.counted()?.to_vec());
        }
        sample.trailing = c.rest().to_vec();
        Ok(sample)
    }

    /// Extracts the id trailer from a non-sample record body.
    ///
    /// Returns an empty [`SampleId`] when the event does not request the
    /// trailer. `kind` is only used for error reporting.
    pub fn parse_id_trailer(&self, kind: u32, body: &[u8]) -> Result<SampleId, DecodeError> {
        let mut sid = SampleId::default();
        if !self.sample_id_all {
            return Ok(sid);
        }
        let needed = self.trailer_len();
        if body.len() < needed {
            return Err(DecodeError::ShortBody { kind, needed, len: body.len() });
        }

        // The trailer is written in sample field order, so walking from
        // the end of the body visits the fields in reverse.
        let mut end = body.len();
        let pull = |end: &mut usize| {
            *end -= 8;
            *end
        };

        if self.has(flag::IDENTIFIER) {
            sid.id = Some(u64_at(body, pull(&mut end)));
        }
        if self.has(flag::CPU) {
            sid.cpu = Some(u32_at(body, pull(&mut end)));
        }
        if self.has(flag::STREAM_ID) {
            sid.stream_id = Some(u64_at(body, pull(&mut end)));
        }
        if self.has(flag::ID) {
            sid.id = Some(u64_at(body, pull(&mut end)));
        }
        if self.has(flag::TIME) {
            sid.time = Some(u64_at(body, pull(&mut end)));
        }
        if self.has(flag::TID) {
            let at = pull(&mut end);
            sid.pid = Some(u32_at(body, at));
            sid.tid = Some(u32_at(body, at + 4));
        }
        Ok(sid)
    }
}

fn u64_at(body: &[u8], at: usize) -> u64 {
    u64::from_ne_bytes(body[at..at + 8].try_into().unwrap())
}

fn u32_at(body: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes(body[at..at + 4].try_into().unwrap())
}

/// One decoded counter sample.
///
/// Every field is optional; a field is present exactly when the producing
/// event requested it. Consumers should treat absent fields as "not
/// recorded" rather than zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sample {
    pub identifier: Option<u64>,
    pub ip: Option<u64>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub time: Option<u64>,
    pub addr: Option<u64>,
    pub id: Option<u64>,
    pub stream_id: Option<u64>,
    pub cpu: Option<u32>,
    pub period: Option<u64>,
    /// Counted opaque payload, present with [`flag::RAW`].
    pub raw: Option<Vec<u8>>,
    /// Bytes of fields this crate could not interpret, preserved verbatim.
    pub trailing: Vec<u8>,
}

impl Sample {
    /// The stream identifier usable for routing, from whichever id field
    /// the sample carries.
    pub fn routing_id(&self) -> Option<u64> {
        self.identifier.or(self.id)
    }
}

/// Identifying fields shared by all records of a stream, as carried in
/// the non-sample id trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleId {
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub time: Option<u64>,
    pub id: Option<u64>,
    pub stream_id: Option<u64>,
    pub cpu: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Enc(Vec<u8>);

    impl Enc {
        fn new() -> Enc {
            Enc(Vec::new())
        }

        fn u32(mut self, v: u32) -> Enc {
            self.0.extend_from_slice(&v.to_ne_bytes());
            self
        }

        fn u64(mut self, v: u64) -> Enc {
            self.0.extend_from_slice(&v.to_ne_bytes());
            self
        }

        fn bytes(mut self, v: &[u8]) -> Enc {
            self.0.extend_from_slice(v);
            self
        }
    }

    #[test]
    fn requested_fields_fill_their_slots() {
        let layout = EventLayout::new(flag::TID | flag::TIME | flag::CPU, false);
        let body = Enc::new()
            .u32(500) // pid
            .u32(501) // tid
            .u64(123_456_789) // time
            .u32(2) // cpu
            .u32(0) // reserved
            .0;
        let sample = layout.parse_sample(&body).unwrap();
        assert_eq!(sample.pid, Some(500));
        assert_eq!(sample.tid, Some(501));
        assert_eq!(sample.time, Some(123_456_789));
        assert_eq!(sample.cpu, Some(2));
        assert_eq!(sample.ip, None);
        assert_eq!(sample.period, None);
        assert!(sample.trailing.is_empty());
    }

    #[test]
    fn identifier_leads_regardless_of_bit_position() {
        let layout = EventLayout::new(flag::IDENTIFIER | flag::IP | flag::PERIOD, false);
        assert!(layout.identifier_first());
        let body = Enc::new().u64(9).u64(0xdead_beef).u64(4_000).0;
        let sample = layout.parse_sample(&body).unwrap();
        assert_eq!(sample.identifier, Some(9));
        assert_eq!(sample.ip, Some(0xdead_beef));
        assert_eq!(sample.period, Some(4_000));
        assert_eq!(sample.routing_id(), Some(9));
    }

    #[test]
    fn raw_payload_is_counted() {
        let layout = EventLayout::new(flag::RAW, false);
        // Producers pad the declared length so the blob plus its length
        // word end on an 8-byte boundary.
        let body = Enc::new().u32(12).bytes(&[7u8; 12]).0;
        let sample = layout.parse_sample(&body).unwrap();
        assert_eq!(sample.raw.as_deref(), Some(&[7u8; 12][..]));
        assert!(sample.trailing.is_empty());
    }

    #[test]
    fn unsized_field_turns_the_rest_opaque() {
        let layout = EventLayout::new(flag::TIME | flag::READ | flag::RAW, false);
        let body = Enc::new().u64(42).u64(1).u64(2).0;
        let sample = layout.parse_sample(&body).unwrap();
        assert_eq!(sample.time, Some(42));
        // The read block's size is unknown, so the raw blob that follows
        // it cannot be located.
        assert_eq!(sample.raw, None);
        assert_eq!(sample.trailing.len(), 16);
    }

    #[test]
    fn fields_after_raw_stay_opaque_but_raw_decodes() {
        let after_raw = 1 << 11;
        let layout = EventLayout::new(flag::RAW | after_raw, false);
        let body = Enc::new().u32(4).bytes(&[1, 2, 3, 4]).u64(0xfeed).0;
        let sample = layout.parse_sample(&body).unwrap();
        assert_eq!(sample.raw.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(sample.trailing.len(), 8);
    }

    #[test]
    fn short_sample_body_reports_the_missing_field() {
        let layout = EventLayout::new(flag::TIME, false);
        match layout.parse_sample(&[0u8; 4]) {
            Err(DecodeError::ShortBody { kind: k, needed: 8, len: 4 }) => {
                assert_eq!(k, kind::SAMPLE);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn oversized_raw_length_is_rejected() {
        let layout = EventLayout::new(flag::RAW, false);
        let body = Enc::new().u32(100).bytes(&[0u8; 8]).0;
        match layout.parse_sample(&body) {
            Err(DecodeError::BadLength { declared: 100, len: 8, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn id_trailer_round_trips_through_reverse_walk() {
        let layout =
            EventLayout::new(flag::TID | flag::TIME | flag::ID | flag::CPU | flag::IDENTIFIER, true);
        assert_eq!(layout.trailer_len(), 40);
        // A COMM-shaped body followed by the trailer in field order.
        let body = Enc::new()
            .u32(7)
            .u32(7)
            .bytes(b"sh\0\0\0\0\0\0")
            .u32(30) // pid
            .u32(31) // tid
            .u64(555) // time
            .u64(12) // id
            .u32(3) // cpu
            .u32(0)
            .u64(12) // identifier
            .0;
        let sid = layout.parse_id_trailer(3, &body).unwrap();
        assert_eq!(
            sid,
            SampleId {
                pid: Some(30),
                tid: Some(31),
                time: Some(555),
                id: Some(12),
                stream_id: None,
                cpu: Some(3),
            }
        );
    }

    #[test]
    fn trailer_is_empty_without_sample_id_all() {
        let layout = EventLayout::new(flag::TID | flag::ID, false);
        assert_eq!(layout.trailer_len(), 0);
        let sid = layout.parse_id_trailer(3, &[1, 2, 3]).unwrap();
        assert_eq!(sid, SampleId::default());
    }

    #[test]
    fn short_trailer_is_an_error() {
        let layout = EventLayout::new(flag::ID | flag::TIME, true);
        match layout.parse_id_trailer(4, &[0u8; 10]) {
            Err(DecodeError::ShortBody { kind: 4, needed: 16, len: 10 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
