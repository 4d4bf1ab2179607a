//! Streaming records out of a mapped ring buffer.
//!
//! The data region is a power-of-two byte ring indexed by free-running
//! logical offsets: the producer publishes bytes by advancing `data_head`
//! and the consumer returns space by storing `data_tail`. Records are
//! copied out before the tail moves, so the producer can never overwrite
//! bytes a returned record still refers to. Record boundaries come solely
//! from the size field of each header; a size that disagrees with the
//! published byte count means the stream has no recoverable framing left.

use std::cmp;
use std::ptr;

use crate::errors::DecodeError;
use crate::page::ControlPage;
use crate::record::{RawRecord, RecordHeader, RECORD_HEADER_SIZE};

/// Exclusive consumer cursor over one ring buffer.
///
/// Holds the logical tail position locally and mirrors it to the control
/// page after each record, as the consumer side of the head/tail
/// protocol. Exactly one reader may exist per ring.
pub struct RingReader {
    page: ControlPage,
    data: *const u8,
    data_len: usize,
    tail: u64,
    records: u64,
    bytes: u64,
}

// The raw pointers come with exclusive consumption rights over memory
// that the constructor contract keeps alive, so the reader can move to
// another thread.
unsafe impl Send for RingReader {}

impl RingReader {
    /// Builds a reader over an already established mapping.
    ///
    /// Consumption resumes from the `data_tail` currently stored in the
    /// control page.
    ///
    /// # Safety
    ///
    /// `page` and `data` must belong to the same live mapping, with
    /// `data` addressing the full `data_len`-byte data region, and
    /// `data_len` must be zero or a power of two. Both must stay mapped
    /// for the reader's lifetime, and no other consumer may advance
    /// `data_tail` while the reader exists.
    pub unsafe fn from_raw_parts(
        page: ControlPage,
        data: *const u8,
        data_len: usize,
    ) -> RingReader {
        debug_assert!(data_len == 0 || data_len.is_power_of_two());
        let tail = page.data_tail();
        RingReader { page, data, data_len, tail, records: 0, bytes: 0 }
    }

    /// Copies out the next pending record, or `None` once the consumer
    /// has caught up with the producer.
    ///
    /// The consumed ring space is returned to the producer before this
    /// call returns. Errors indicate a producer-side framing violation
    /// and will repeat on every subsequent call; nothing is consumed.
    pub fn read_next(&mut self) -> Result<Option<RawRecord>, DecodeError> {
        let head = self.page.data_head();
        let available = match head.checked_sub(self.tail) {
            Some(n) if n > 0 => n,
            _ => return Ok(None),
        };
        // An intact producer never publishes more than one ring of
        // unconsumed bytes; `available` bounds every copy below.
        if available > self.data_len as u64 {
            return Err(DecodeError::HeadBeyondRing { available, ring: self.data_len });
        }
        if available < RECORD_HEADER_SIZE as u64 {
            return Err(DecodeError::TruncatedHeader { available });
        }

        let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
        self.copy_out(self.tail, &mut header_bytes);
        let header = RecordHeader::parse(header_bytes);
        if (header.size as usize) < RECORD_HEADER_SIZE {
            return Err(DecodeError::SizeTooSmall { declared: header.size });
        }
        if u64::from(header.size) > available {
            return Err(DecodeError::SizeBeyondHead { declared: header.size, available });
        }

        let mut body = vec![0u8; header.size as usize - RECORD_HEADER_SIZE];
        self.copy_out(self.tail + RECORD_HEADER_SIZE as u64, &mut body);

        self.tail += u64::from(header.size);
        self.page.set_data_tail(self.tail);
        self.records += 1;
        self.bytes += u64::from(header.size);
        Ok(Some(RawRecord { header, body }))
    }

    /// Bytes published by the producer but not yet consumed.
    pub fn pending(&self) -> u64 {
        self.page.data_head().saturating_sub(self.tail)
    }

    pub fn records_consumed(&self) -> u64 {
        self.records
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes
    }

    /// Copies `dst.len()` bytes starting at logical offset `logical`,
    /// stitching the two segments back together when the range wraps the
    /// end of the ring.
    fn copy_out(&self, logical: u64, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.data_len);
        let mask = (self.data_len - 1) as u64;
        let start = (logical & mask) as usize;
        let first = cmp::min(dst.len(), self.data_len - start);
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(start), dst.as_mut_ptr(), first);
            if dst.len() > first {
                ptr::copy_nonoverlapping(
                    self.data,
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::kind;
    use perf_event_open_sys::bindings::perf_event_mmap_page;
    use std::mem;

    /// An in-memory ring with a producer side, laid out like a real
    /// mapping but without a kernel behind it. The backing storage is
    /// held as raw allocations so the producer and the reader under test
    /// can alias it the same way the kernel and a consumer do.
    struct TestRing {
        page: *mut perf_event_mmap_page,
        data: *mut u8,
        len: usize,
        head: u64,
    }

    impl TestRing {
        fn new(len: usize) -> TestRing {
            assert!(len.is_power_of_two());
            let page = Box::into_raw(Box::new(unsafe { mem::zeroed() }));
            let data = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
            TestRing { page, data, len, head: 0 }
        }

        fn reader(&self) -> RingReader {
            let page = unsafe { ControlPage::from_ptr(self.page) };
            unsafe { RingReader::from_raw_parts(page, self.data, self.len) }
        }

        fn write_bytes(&mut self, bytes: &[u8]) {
            let mask = self.len - 1;
            for (i, b) in bytes.iter().enumerate() {
                let at = (self.head as usize + i) & mask;
                unsafe { *self.data.add(at) = *b };
            }
            self.head += bytes.len() as u64;
        }

        /// Appends a framed record and publishes it.
        fn push(&mut self, kind: u32, body: &[u8]) {
            let size = (RECORD_HEADER_SIZE + body.len()) as u16;
            let mut rec = Vec::with_capacity(size as usize);
            rec.extend_from_slice(&kind.to_ne_bytes());
            rec.extend_from_slice(&0u16.to_ne_bytes());
            rec.extend_from_slice(&size.to_ne_bytes());
            rec.extend_from_slice(body);
            self.write_bytes(&rec);
            self.publish();
        }

        /// Appends a record whose header claims `claimed` total bytes
        /// while publishing only the header and `body`.
        fn push_lying(&mut self, kind: u32, claimed: u16, body: &[u8]) {
            let mut rec = Vec::new();
            rec.extend_from_slice(&kind.to_ne_bytes());
            rec.extend_from_slice(&0u16.to_ne_bytes());
            rec.extend_from_slice(&claimed.to_ne_bytes());
            rec.extend_from_slice(body);
            self.write_bytes(&rec);
            self.publish();
        }

        fn publish(&mut self) {
            unsafe { (*self.page).data_head = self.head };
        }

        fn published_tail(&self) -> u64 {
            unsafe { (*self.page).data_tail }
        }
    }

    impl Drop for TestRing {
        fn drop(&mut self) {
            unsafe {
                drop(Box::from_raw(self.page));
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.data, self.len)));
            }
        }
    }

    #[test]
    fn empty_ring_reads_none() {
        let ring = TestRing::new(64);
        let mut reader = ring.reader();
        assert_eq!(reader.read_next().unwrap(), None);
        assert_eq!(reader.read_next().unwrap(), None);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn records_stream_in_order_and_return_space() {
        let mut ring = TestRing::new(256);
        let mut reader = ring.reader();
        ring.push(kind::COMM, &[1; 16]);
        ring.push(kind::LOST, &[2; 16]);

        let first = reader.read_next().unwrap().unwrap();
        assert_eq!(first.header.kind, kind::COMM);
        assert_eq!(first.body, vec![1; 16]);

        let second = reader.read_next().unwrap().unwrap();
        assert_eq!(second.header.kind, kind::LOST);
        assert_eq!(second.body, vec![2; 16]);

        assert_eq!(reader.read_next().unwrap(), None);
        assert_eq!(ring.published_tail(), 48);
        assert_eq!(reader.records_consumed(), 2);
        assert_eq!(reader.bytes_consumed(), 48);
    }

    #[test]
    fn drained_ring_reports_new_records_after_append() {
        let mut ring = TestRing::new(64);
        let mut reader = ring.reader();
        assert_eq!(reader.read_next().unwrap(), None);

        ring.push(kind::COMM, &[9; 8]);
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.header.kind, kind::COMM);
        assert_eq!(reader.read_next().unwrap(), None);

        ring.push(kind::EXIT, &[7; 8]);
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.header.kind, kind::EXIT);
        assert_eq!(reader.read_next().unwrap(), None);
    }

    #[test]
    fn wrapped_record_is_reassembled() {
        let mut ring = TestRing::new(64);
        let mut reader = ring.reader();

        ring.push(kind::COMM, &[0; 40]);
        assert!(reader.read_next().unwrap().is_some());

        // The next record occupies logical 48..80 and wraps 16 bytes
        // around the end of the 64-byte ring.
        let body: Vec<u8> = (0u8..24).collect();
        ring.push(kind::MMAP, &body);
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.header.kind, kind::MMAP);
        assert_eq!(rec.body, body);
        assert_eq!(ring.published_tail(), 80);
    }

    #[test]
    fn size_past_head_is_fatal_and_sticky() {
        let mut ring = TestRing::new(64);
        let mut reader = ring.reader();
        ring.push_lying(kind::SAMPLE, 40, &[0; 8]);

        for _ in 0..2 {
            match reader.read_next() {
                Err(DecodeError::SizeBeyondHead { declared: 40, available: 16 }) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
        // Nothing was consumed.
        assert_eq!(ring.published_tail(), 0);
    }

    #[test]
    fn size_below_header_size_is_fatal() {
        let mut ring = TestRing::new(64);
        let mut reader = ring.reader();
        ring.push_lying(kind::SAMPLE, 4, &[0; 8]);
        match reader.read_next() {
            Err(DecodeError::SizeTooSmall { declared: 4 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn head_past_ring_capacity_is_fatal_and_sticky() {
        let mut ring = TestRing::new(64);
        let mut reader = ring.reader();
        // Three rings of pending data cannot fit a 64-byte ring.
        ring.head = 192;
        ring.publish();

        for _ in 0..2 {
            match reader.read_next() {
                Err(DecodeError::HeadBeyondRing { available: 192, ring: 64 }) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert_eq!(ring.published_tail(), 0);
        assert_eq!(reader.records_consumed(), 0);
    }

    #[test]
    fn partial_header_is_fatal() {
        let mut ring = TestRing::new(64);
        let mut reader = ring.reader();
        ring.write_bytes(&[0; 4]);
        ring.publish();
        match reader.read_next() {
            Err(DecodeError::TruncatedHeader { available: 4 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn reader_resumes_from_stored_tail() {
        let mut ring = TestRing::new(128);
        ring.push(kind::COMM, &[1; 8]);
        ring.push(kind::EXIT, &[2; 8]);
        unsafe { (*ring.page).data_tail = 16 };

        let mut reader = ring.reader();
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.header.kind, kind::EXIT);
        assert_eq!(reader.read_next().unwrap(), None);
    }
}
