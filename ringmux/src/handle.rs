//! Counter registration and the per-counter state of an open set.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use perf_event_open_sys::bindings as sys;
use perf_event_open_sys::{ioctls, perf_event_open};
use ringside::EventLayout;
use smallvec::SmallVec;

/// A counter to register: a display name plus the raw event attributes.
///
/// The attributes are taken as configured except that opening adds the
/// stream id to the read format, and, when several counters share a set,
/// an identifier field to the sample layout so records stay routable.
pub struct CounterSpec {
    pub name: String,
    pub attr: sys::perf_event_attr,
}

impl CounterSpec {
    pub fn new(name: impl Into<String>, attr: sys::perf_event_attr) -> CounterSpec {
        CounterSpec { name: name.into(), attr }
    }
}

/// The cpu/process contexts a counter set is opened against.
///
/// Context conventions follow the event syscall: cpu `-1` means "any
/// cpu", pid `-1` means "all processes" (requires a concrete cpu), and
/// pid `0` is the calling process. Every cpu is paired with every pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    cpus: Vec<i32>,
    pids: Vec<i32>,
}

impl Targets {
    /// Explicit cpu and pid lists; an empty list means "any" (`-1`).
    pub fn new(cpus: Vec<i32>, pids: Vec<i32>) -> Targets {
        let cpus = if cpus.is_empty() { vec![-1] } else { cpus };
        let pids = if pids.is_empty() { vec![-1] } else { pids };
        Targets { cpus, pids }
    }

    /// The calling process, on whatever cpu it runs.
    pub fn this_process() -> Targets {
        Targets { cpus: vec![-1], pids: vec![0] }
    }

    /// Everything that runs on the given cpus.
    pub fn system_wide(cpus: Vec<i32>) -> Targets {
        Targets::new(cpus, vec![-1])
    }

    /// The given processes, on whatever cpu they run.
    pub fn processes(pids: Vec<i32>) -> Targets {
        Targets::new(Vec::new(), pids)
    }

    /// All `(cpu, pid)` pairs, cpu-major.
    pub(crate) fn contexts(&self) -> Vec<(i32, i32)> {
        let mut out = Vec::with_capacity(self.cpus.len() * self.pids.len());
        for &cpu in &self.cpus {
            for &pid in &self.pids {
                out.push((cpu, pid));
            }
        }
        out
    }
}

/// One registered counter of an open set.
///
/// Holds the fds the counter was opened with, one per context, and the
/// kernel stream ids that route records back to it. Handles are owned by
/// the set; dropping the set closes the fds.
pub struct CounterHandle {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) attr: sys::perf_event_attr,
    pub(crate) layout: EventLayout,
    pub(crate) fds: SmallVec<[RawFd; 4]>,
    pub(crate) ids: SmallVec<[u64; 4]>,
    pub(crate) samples: u64,
}

impl CounterHandle {
    pub(crate) fn new(index: usize, spec: CounterSpec) -> CounterHandle {
        let layout = EventLayout::new(spec.attr.sample_type, spec.attr.sample_id_all() != 0);
        CounterHandle {
            index,
            name: spec.name,
            attr: spec.attr,
            layout,
            fds: SmallVec::new(),
            ids: SmallVec::new(),
            samples: 0,
        }
    }

    /// Position in registration order; sample routing reports this.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The record layout of this counter's streams.
    pub fn layout(&self) -> EventLayout {
        self.layout
    }

    /// Kernel stream ids, one per opened context.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }

    /// Samples routed to this counter so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub(crate) fn close_fds(&mut self) {
        for fd in self.fds.drain(..) {
            unsafe { libc::close(fd) };
        }
        self.ids.clear();
    }
}

impl Drop for CounterHandle {
    fn drop(&mut self) {
        self.close_fds();
    }
}

/// Opens one event in one context, cloexec like every fd this crate
/// creates.
pub(crate) fn open_event(
    attr: &mut sys::perf_event_attr,
    pid: i32,
    cpu: i32,
    group_fd: RawFd,
) -> io::Result<RawFd> {
    let fd = unsafe {
        perf_event_open(attr, pid, cpu, group_fd, sys::PERF_FLAG_FD_CLOEXEC.into())
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Asks the kernel for the stream id of `fd`.
///
/// Kernels too old for the id ioctl report `ENOTTY`; there the id is
/// recovered from a counter readout, where the read format places it
/// after the value and the optional time fields.
pub(crate) fn kernel_id(fd: RawFd, read_format: u64) -> io::Result<u64> {
    let mut id: u64 = 0;
    let rc = unsafe { ioctls::ID(fd, &mut id) };
    if rc >= 0 {
        return Ok(id);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOTTY) {
        return Err(err);
    }

    if read_format & sys::PERF_FORMAT_ID as u64 == 0
        || read_format & sys::PERF_FORMAT_GROUP as u64 != 0
    {
        return Err(err);
    }
    let mut slots = [0u64; 4];
    let n = unsafe {
        libc::read(fd, slots.as_mut_ptr() as *mut libc::c_void, mem::size_of_val(&slots))
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let slot = id_slot(read_format);
    if (n as usize) < (slot + 1) * 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "counter readout too short to carry the stream id",
        ));
    }
    Ok(slots[slot])
}

/// Index of the id in a non-group counter readout.
fn id_slot(read_format: u64) -> usize {
    let mut slot = 1;
    if read_format & sys::PERF_FORMAT_TOTAL_TIME_ENABLED as u64 != 0 {
        slot += 1;
    }
    if read_format & sys::PERF_FORMAT_TOTAL_TIME_RUNNING as u64 != 0 {
        slot += 1;
    }
    slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_target_lists_mean_any() {
        let targets = Targets::new(vec![], vec![]);
        assert_eq!(targets.contexts(), vec![(-1, -1)]);
    }

    #[test]
    fn contexts_pair_every_cpu_with_every_pid() {
        let targets = Targets::new(vec![0, 1], vec![100, 200]);
        assert_eq!(
            targets.contexts(),
            vec![(0, 100), (0, 200), (1, 100), (1, 200)]
        );
    }

    #[test]
    fn this_process_is_one_context() {
        assert_eq!(Targets::this_process().contexts(), vec![(-1, 0)]);
    }

    #[test]
    fn process_targets_cover_any_cpu() {
        assert_eq!(Targets::processes(vec![7, 9]).contexts(), vec![(-1, 7), (-1, 9)]);
        // An empty list falls back to "any", never to no contexts at all.
        assert_eq!(Targets::processes(vec![]).contexts(), vec![(-1, -1)]);
        assert_eq!(Targets::system_wide(vec![]).contexts(), vec![(-1, -1)]);
    }

    #[test]
    fn id_slot_skips_the_time_fields() {
        let id = sys::PERF_FORMAT_ID as u64;
        let enabled = sys::PERF_FORMAT_TOTAL_TIME_ENABLED as u64;
        let running = sys::PERF_FORMAT_TOTAL_TIME_RUNNING as u64;
        assert_eq!(id_slot(id), 1);
        assert_eq!(id_slot(id | enabled), 2);
        assert_eq!(id_slot(id | enabled | running), 3);
    }
}
