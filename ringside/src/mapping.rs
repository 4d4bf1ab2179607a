//! Establishing ring-buffer mappings over event file descriptors.

use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use perf_event_open_sys::bindings::perf_event_mmap_page;

use crate::errors::{DecodeError, MapError, SelfReadError};
use crate::page::ControlPage;
use crate::reader::RingReader;
use crate::record::RawRecord;
use crate::self_read::SelfReader;

/// Geometry of a ring-buffer mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConfig {
    /// Pages in the data region, zero or a power of two. Zero maps the
    /// control page alone, which is all the self-read path needs.
    pub data_pages: usize,
}

impl MapConfig {
    pub fn new(data_pages: usize) -> MapConfig {
        MapConfig { data_pages }
    }

    /// A mapping with no record stream, for counters that are only ever
    /// read through the control page.
    pub fn control_only() -> MapConfig {
        MapConfig { data_pages: 0 }
    }
}

impl Default for MapConfig {
    /// 128 data pages, 512 KiB on 4 KiB-page systems.
    fn default() -> MapConfig {
        MapConfig { data_pages: 128 }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An established mapping over one event fd: the control page plus an
/// optional record data region.
///
/// Owns the mapped memory but not the fd; the mapping stays valid if the
/// fd is closed first, though no new records arrive once the event is
/// gone. The mapping is the exclusive consumer of its ring.
pub struct RingMapping {
    _mmap: MmapMut,
    page: *mut perf_event_mmap_page,
    reader: RingReader,
    data_len: usize,
    fd: RawFd,
}

// One owner consumes the mapping; the raw pointers target memory owned
// by `_mmap`, which moves with the struct.
unsafe impl Send for RingMapping {}

impl RingMapping {
    /// Maps `config.data_pages` ring pages plus the control page over
    /// `fd`, which must come from the event syscall. The fd is borrowed
    /// for the call only.
    pub fn new(fd: RawFd, config: &MapConfig) -> Result<RingMapping, MapError> {
        let data_pages = config.data_pages;
        if data_pages != 0 && !data_pages.is_power_of_two() {
            return Err(MapError::BadPageCount(data_pages));
        }
        // `from_raw_fd` refuses -1, the failure value of the event
        // syscall; report bad fds the way mmap(2) would.
        if fd < 0 {
            return Err(MapError::Os(io::Error::from_raw_os_error(libc::EBADF)));
        }
        let page_size = page_size();
        let data_len = data_pages * page_size;

        // Reconstituted only so mmap has a `File` to borrow; ownership
        // goes back to the caller before any early return.
        let file = unsafe { fs::File::from_raw_fd(fd) };
        let mmap = unsafe {
            MmapOptions::new()
                .len(page_size + data_len)
                .map_mut(&file)
        };
        let _ = file.into_raw_fd();
        let mut mmap = mmap?;

        debug_assert!(mmap.len() >= mem::size_of::<perf_event_mmap_page>());
        let page = mmap.as_mut_ptr() as *mut perf_event_mmap_page;
        let view = unsafe { ControlPage::from_ptr(page) };
        let compat = view.compat_version();
        if compat != 0 {
            return Err(MapError::UnsupportedVersion(compat));
        }

        let data = unsafe { mmap.as_ptr().add(page_size) };
        let reader = unsafe { RingReader::from_raw_parts(view, data, data_len) };
        debug!(
            "mapped event fd {}: {} data pages, control page abi version {}",
            fd,
            data_pages,
            view.version()
        );
        Ok(RingMapping { _mmap: mmap, page, reader, data_len, fd })
    }

    fn page(&self) -> ControlPage {
        unsafe { ControlPage::from_ptr(self.page) }
    }

    /// The fd this mapping was established over, for readiness polling.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bytes in the data region.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Copies out the next pending record. See [`RingReader::read_next`].
    pub fn read_next(&mut self) -> Result<Option<RawRecord>, DecodeError> {
        self.reader.read_next()
    }

    /// Bytes published by the producer but not yet consumed.
    pub fn pending(&self) -> u64 {
        self.reader.pending()
    }

    pub fn records_consumed(&self) -> u64 {
        self.reader.records_consumed()
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.reader.bytes_consumed()
    }

    /// Whether the kernel allows reading the counter register directly
    /// from userspace on this mapping.
    pub fn user_register_access(&self) -> bool {
        self.page().user_register_access()
    }

    /// A syscall-free value reader over this mapping's counter.
    ///
    /// Fails if the kernel denies userspace register access or the
    /// target cannot issue the reads.
    pub fn self_reader(&self) -> Result<SelfReader<'_>, SelfReadError> {
        SelfReader::new(self.page())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_must_be_zero_or_a_power_of_two() {
        match RingMapping::new(-1, &MapConfig::new(3)) {
            Err(MapError::BadPageCount(3)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn mmap_failure_surfaces_the_os_error() {
        match RingMapping::new(-1, &MapConfig::control_only()) {
            Err(MapError::Os(e)) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
