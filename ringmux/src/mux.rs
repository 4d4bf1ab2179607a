//! The counter set: opening against targets, ring wiring, and routing
//! records back to the counters that produced them.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::{debug, warn};
use perf_event_open_sys::bindings as sys;
use perf_event_open_sys::ioctls;
use ringside::record::kind;
use ringside::sample::flag;
use ringside::{
    DecodeError, EventLayout, MapConfig, RawRecord, Record, RingMapping, Sample, SampleId,
};
use rustc_hash::FxHashMap;

use crate::errors::OpenError;
use crate::handle::{kernel_id, open_event, CounterHandle, CounterSpec, Targets};

/// How a counter set maps and schedules its streams.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Ring geometry for every mapping the set establishes.
    pub map: MapConfig,
    /// One ring per context shared by all counters through output
    /// redirection, instead of one ring per counter per context.
    pub shared_rings: bool,
    /// Schedule the set as one scheduling group, first registered
    /// counter as leader: all counters count together or not at all.
    pub grouped: bool,
}

impl Default for MuxConfig {
    fn default() -> MuxConfig {
        MuxConfig { map: MapConfig::default(), shared_rings: true, grouped: false }
    }
}

struct MuxStream {
    mapping: RingMapping,
    cpu: i32,
    pid: i32,
    /// Owning counter for dedicated rings. Shared rings carry records
    /// from the whole set and route by id instead.
    handle: Option<usize>,
    fault: Option<DecodeError>,
}

/// Per-stream consumption state.
#[derive(Debug)]
pub struct StreamStatus<'a> {
    pub stream: usize,
    pub cpu: i32,
    pub pid: i32,
    pub records: u64,
    pub bytes: u64,
    pub pending: u64,
    pub fault: Option<&'a DecodeError>,
}

/// Which counters of a set came up, and what stopped the others.
#[derive(Default)]
pub struct OpenReport {
    pub opened: Vec<usize>,
    pub failed: Vec<(usize, OpenError)>,
}

/// One record out of a polling pass.
#[derive(Debug)]
pub enum MuxEvent {
    /// A decoded sample, routed to the counter that produced it.
    Sample { handle: usize, sample: Sample },
    /// A sample whose stream id matches no registered counter.
    Orphan { sample: Sample },
    /// A non-sample record, attributed to a counter when its id trailer
    /// allows.
    Side { handle: Option<usize>, record: Record, sid: SampleId },
    /// The stream turned out malformed and was taken out of rotation.
    Fault { stream: usize, error: DecodeError },
}

/// A set of counters multiplexed over shared ring buffers.
///
/// Counters are registered first, then the whole set is opened against a
/// set of cpu/process contexts. Opening leaves every counter disabled;
/// [`enable_all`] starts them atomically enough for most uses, and
/// records are drained with [`poll_all`], blocking in [`wait`] when
/// everything is quiet.
///
/// [`enable_all`]: EventMux::enable_all
/// [`poll_all`]: EventMux::poll_all
/// [`wait`]: EventMux::wait
pub struct EventMux {
    config: MuxConfig,
    // Streams before handles: mappings must unmap before the fds they
    // were established over are closed.
    streams: Vec<MuxStream>,
    handles: Vec<CounterHandle>,
    routes: FxHashMap<u64, usize>,
    /// The common layout when every counter shares one; mixed sets
    /// route by leading identifier before full decode instead.
    uniform: Option<EventLayout>,
    orphans: u64,
    opened: bool,
}

impl EventMux {
    pub fn new(config: MuxConfig) -> EventMux {
        EventMux {
            config,
            streams: Vec::new(),
            handles: Vec::new(),
            routes: FxHashMap::default(),
            uniform: None,
            orphans: 0,
            opened: false,
        }
    }

    pub fn with_defaults() -> EventMux {
        EventMux::new(MuxConfig::default())
    }

    /// Adds a counter to the set, returning its handle index. All
    /// registration happens before [`open`](EventMux::open).
    pub fn register(&mut self, spec: CounterSpec) -> Result<usize, OpenError> {
        if self.opened {
            return Err(OpenError::AlreadyOpen);
        }
        let index = self.handles.len();
        debug!("registering counter `{}` at index {}", spec.name, index);
        self.handles.push(CounterHandle::new(index, spec));
        Ok(index)
    }

    /// Opens every registered counter in every target context, maps the
    /// rings, and builds the id route table.
    ///
    /// A counter that fails to open is closed again and reported in the
    /// returned [`OpenReport`] without stopping its siblings; the
    /// exceptions are the group leader in grouped mode and any failure
    /// to establish a ring, which abort the whole open. Counters come up
    /// disabled.
    pub fn open(&mut self, targets: &Targets) -> Result<OpenReport, OpenError> {
        if self.opened {
            return Err(OpenError::AlreadyOpen);
        }
        if self.handles.is_empty() {
            return Err(OpenError::NoCounters);
        }

        self.finalize_attrs();
        let contexts = targets.contexts();
        let mut report = OpenReport::default();

        for hidx in 0..self.handles.len() {
            match self.open_handle(hidx, &contexts) {
                Ok(()) => report.opened.push(hidx),
                Err(e) => {
                    if self.config.grouped && hidx == 0 {
                        // Nothing can join a group whose leader is gone.
                        self.rollback();
                        return Err(e);
                    }
                    warn!("counter `{}` failed to open: {}", self.handles[hidx].name, e);
                    report.failed.push((hidx, e));
                }
            }
        }

        if let Err(e) = self.establish_rings(&contexts, &report.opened) {
            self.rollback();
            return Err(e);
        }

        for &hidx in &report.opened {
            for &id in self.handles[hidx].ids.iter() {
                self.routes.insert(id, hidx);
            }
        }
        self.uniform = self.common_layout(&report.opened);
        self.opened = true;
        debug!(
            "counter set open: {} of {} counters, {} streams, {} routes",
            report.opened.len(),
            self.handles.len(),
            self.streams.len(),
            self.routes.len()
        );
        Ok(report)
    }

    /// Pins down the attribute fields the routing protocol relies on.
    fn finalize_attrs(&mut self) {
        let mixed_ring = self.handles.len() > 1 && self.config.shared_rings;
        for handle in &mut self.handles {
            handle.attr.size = mem::size_of::<sys::perf_event_attr>().try_into().unwrap();
            handle.attr.read_format |= sys::PERF_FORMAT_ID as u64;
            if mixed_ring {
                // Records interleaved on one ring must carry an
                // identifier readable without knowing the producing
                // layout: first field of samples, last of trailers.
                handle.attr.sample_type |= flag::IDENTIFIER;
                handle.attr.set_sample_id_all(1);
            }
            handle.layout =
                EventLayout::new(handle.attr.sample_type, handle.attr.sample_id_all() != 0);
        }
    }

    fn open_handle(&mut self, hidx: usize, contexts: &[(i32, i32)]) -> Result<(), OpenError> {
        let mut attr = self.handles[hidx].attr;
        let read_format = attr.read_format;
        for (ci, &(cpu, pid)) in contexts.iter().enumerate() {
            let group_fd = if self.config.grouped && hidx > 0 {
                self.handles[0].fds[ci]
            } else {
                -1
            };
            let fd = match open_event(&mut attr, pid, cpu, group_fd) {
                Ok(fd) => fd,
                Err(e) => {
                    self.handles[hidx].close_fds();
                    return Err(OpenError::Event {
                        name: self.handles[hidx].name.clone(),
                        source: e,
                    });
                }
            };
            debug!(
                "opened `{}` on cpu {} pid {} as fd {}",
                self.handles[hidx].name, cpu, pid, fd
            );
            self.handles[hidx].fds.push(fd);

            match kernel_id(fd, read_format) {
                Ok(id) => self.handles[hidx].ids.push(id),
                Err(e) => {
                    self.handles[hidx].close_fds();
                    return Err(OpenError::Event {
                        name: self.handles[hidx].name.clone(),
                        source: e,
                    });
                }
            }
        }
        Ok(())
    }

    fn establish_rings(
        &mut self,
        contexts: &[(i32, i32)],
        opened: &[usize],
    ) -> Result<(), OpenError> {
        let Some((&ring_owner, rest)) = opened.split_first() else {
            return Ok(());
        };

        if self.config.shared_rings {
            for (ci, &(cpu, pid)) in contexts.iter().enumerate() {
                let ring_fd = self.handles[ring_owner].fds[ci];
                let mapping = RingMapping::new(ring_fd, &self.config.map)
                    .map_err(|e| OpenError::Ring { source: e })?;
                for &other in rest {
                    let fd = self.handles[other].fds[ci];
                    let rc = unsafe { ioctls::SET_OUTPUT(fd, ring_fd) };
                    if rc < 0 {
                        return Err(OpenError::Redirect {
                            name: self.handles[other].name.clone(),
                            source: io::Error::last_os_error(),
                        });
                    }
                }
                self.streams.push(MuxStream { mapping, cpu, pid, handle: None, fault: None });
            }
        } else {
            for &hidx in opened {
                for (ci, &(cpu, pid)) in contexts.iter().enumerate() {
                    let fd = self.handles[hidx].fds[ci];
                    let mapping = RingMapping::new(fd, &self.config.map)
                        .map_err(|e| OpenError::Ring { source: e })?;
                    self.streams.push(MuxStream {
                        mapping,
                        cpu,
                        pid,
                        handle: Some(hidx),
                        fault: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// The layout every opened counter shares, when they all agree; a
    /// mixed set gets none and routes records by in-band identifier.
    fn common_layout(&self, opened: &[usize]) -> Option<EventLayout> {
        let mut layouts = opened.iter().map(|&h| self.handles[h].layout);
        let first = layouts.next()?;
        layouts.all(|l| l == first).then_some(first)
    }

    fn rollback(&mut self) {
        self.streams.clear();
        self.routes.clear();
        for handle in &mut self.handles {
            handle.close_fds();
        }
    }

    /// Starts every counter of the set.
    pub fn enable_all(&self) -> io::Result<()> {
        self.ioctl_all(|fd| unsafe { ioctls::ENABLE(fd, 0) })
    }

    /// Stops every counter; already published records stay readable.
    pub fn disable_all(&self) -> io::Result<()> {
        self.ioctl_all(|fd| unsafe { ioctls::DISABLE(fd, 0) })
    }

    fn ioctl_all(&self, f: impl Fn(RawFd) -> libc::c_int) -> io::Result<()> {
        for handle in &self.handles {
            for &fd in handle.fds.iter() {
                if f(fd) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }

    /// Blocks until any healthy stream signals readable data, the
    /// timeout lapses (`None` waits indefinitely), or a signal arrives.
    /// `Ok(true)` means at least one stream is ready.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut fds: Vec<libc::pollfd> = self
            .streams
            .iter()
            .filter(|s| s.fault.is_none())
            .map(|s| libc::pollfd { fd: s.mapping.fd(), events: libc::POLLIN, revents: 0 })
            .collect();
        if fds.is_empty() {
            return Ok(false);
        }
        let timeout_ms: libc::c_int = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }

    /// One pass over all streams in establishment order, draining each
    /// until empty and yielding every record as it is routed. Faulted
    /// streams are skipped; a fresh fault is yielded once and the stream
    /// then drops out of rotation.
    pub fn poll_all(&mut self) -> Drain<'_> {
        Drain { mux: self, stream: 0 }
    }

    fn next_event(&mut self, si: usize) -> Option<MuxEvent> {
        let raw = match self.streams[si].mapping.read_next() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("stream {} is malformed, dropping it: {}", si, e);
                self.streams[si].fault = Some(e.clone());
                return Some(MuxEvent::Fault { stream: si, error: e });
            }
        };
        Some(self.route_record(si, raw))
    }

    fn route_record(&mut self, si: usize, raw: RawRecord) -> MuxEvent {
        let (owner, layout) = self.record_owner(si, &raw);

        if raw.header.kind == kind::SAMPLE {
            match layout.parse_sample(&raw.body) {
                Ok(sample) => self.attribute_sample(owner, sample),
                Err(e) => self.fault_stream(si, e),
            }
        } else {
            let sid = match layout.parse_id_trailer(raw.header.kind, &raw.body) {
                Ok(sid) => sid,
                Err(e) => return self.fault_stream(si, e),
            };
            let record = match raw.decode(&layout) {
                Ok(record) => record,
                Err(e) => return self.fault_stream(si, e),
            };
            let handle = owner.or_else(|| self.route_id(sid.id));
            MuxEvent::Side { handle, record, sid }
        }
    }

    /// Picks the counter a record belongs to, as far as the stream alone
    /// can tell, together with the layout to decode it under.
    fn record_owner(&self, si: usize, raw: &RawRecord) -> (Option<usize>, EventLayout) {
        if let Some(h) = self.streams[si].handle {
            return (Some(h), self.handles[h].layout);
        }
        if let Some(layout) = self.uniform {
            return (None, layout);
        }
        // Mixed layouts on a shared ring: every record leads (samples)
        // or ends (trailers) with its identifier, which picks the
        // producing layout.
        let id = if raw.header.kind == kind::SAMPLE {
            u64_field(&raw.body, 0)
        } else {
            raw.body.len().checked_sub(8).and_then(|at| u64_field(&raw.body, at))
        };
        match id.and_then(|id| self.routes.get(&id).copied()) {
            Some(h) => (Some(h), self.handles[h].layout),
            None => (None, self.fallback_layout()),
        }
    }

    fn fallback_layout(&self) -> EventLayout {
        self.handles
            .iter()
            .find(|h| !h.fds.is_empty())
            .map(|h| h.layout)
            .unwrap_or_else(|| EventLayout::new(0, false))
    }

    fn attribute_sample(&mut self, owner: Option<usize>, sample: Sample) -> MuxEvent {
        match owner.or_else(|| self.route_id(sample.routing_id())) {
            Some(h) => {
                self.handles[h].samples += 1;
                MuxEvent::Sample { handle: h, sample }
            }
            None => {
                self.orphans += 1;
                warn!(
                    "sample carries unknown stream id {:?}, no counter claims it",
                    sample.routing_id()
                );
                MuxEvent::Orphan { sample }
            }
        }
    }

    fn route_id(&self, id: Option<u64>) -> Option<usize> {
        match id {
            Some(id) => self.routes.get(&id).copied(),
            // Records with no id field belong to the only counter there
            // is; with several counters they are unattributable.
            None => (self.handles.len() == 1).then_some(0),
        }
    }

    fn fault_stream(&mut self, si: usize, error: DecodeError) -> MuxEvent {
        warn!("stream {} is malformed, dropping it: {}", si, error);
        self.streams[si].fault = Some(error.clone());
        MuxEvent::Fault { stream: si, error }
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn handles(&self) -> &[CounterHandle] {
        &self.handles
    }

    pub fn handle(&self, index: usize) -> Option<&CounterHandle> {
        self.handles.get(index)
    }

    /// The counter that owns a kernel stream id.
    pub fn lookup(&self, id: u64) -> Option<&CounterHandle> {
        self.routes.get(&id).map(|&h| &self.handles[h])
    }

    /// Samples seen whose stream id matched no counter.
    pub fn orphans(&self) -> u64 {
        self.orphans
    }

    pub fn stream_status(&self) -> Vec<StreamStatus<'_>> {
        self.streams
            .iter()
            .enumerate()
            .map(|(i, s)| StreamStatus {
                stream: i,
                cpu: s.cpu,
                pid: s.pid,
                records: s.mapping.records_consumed(),
                bytes: s.mapping.bytes_consumed(),
                pending: s.mapping.pending(),
                fault: s.fault.as_ref(),
            })
            .collect()
    }
}

fn u64_field(body: &[u8], at: usize) -> Option<u64> {
    body.get(at..at + 8).map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
}

/// Iterator over one routing pass, see [`EventMux::poll_all`].
pub struct Drain<'a> {
    mux: &'a mut EventMux,
    stream: usize,
}

impl Iterator for Drain<'_> {
    type Item = MuxEvent;

    fn next(&mut self) -> Option<MuxEvent> {
        while self.stream < self.mux.streams.len() {
            if self.mux.streams[self.stream].fault.is_some() {
                self.stream += 1;
                continue;
            }
            match self.mux.next_event(self.stream) {
                Some(event) => return Some(event),
                None => self.stream += 1,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, sample_type: u64) -> CounterSpec {
        let mut attr = sys::perf_event_attr::default();
        attr.sample_type = sample_type;
        CounterSpec::new(name, attr)
    }

    /// A set wired up by hand, as if two counters had opened with kernel
    /// ids 1 and 2.
    fn routed_mux() -> EventMux {
        let mut mux = EventMux::with_defaults();
        mux.register(spec("cycles", flag::IDENTIFIER)).unwrap();
        mux.register(spec("faults", flag::IDENTIFIER)).unwrap();
        mux.routes.insert(1, 0);
        mux.routes.insert(2, 1);
        mux.opened = true;
        mux
    }

    fn sample_with_identifier(id: u64) -> Sample {
        Sample { identifier: Some(id), ..Sample::default() }
    }

    #[test]
    fn registration_order_gives_handle_indices() {
        let mut mux = EventMux::with_defaults();
        assert_eq!(mux.register(spec("a", 0)).unwrap(), 0);
        assert_eq!(mux.register(spec("b", 0)).unwrap(), 1);
        assert_eq!(mux.handles()[1].name(), "b");
    }

    #[test]
    fn registration_is_rejected_once_open() {
        let mut mux = routed_mux();
        match mux.register(spec("late", 0)) {
            Err(OpenError::AlreadyOpen) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn open_without_counters_is_an_error() {
        let mut mux = EventMux::with_defaults();
        match mux.open(&Targets::this_process()) {
            Err(OpenError::NoCounters) => {}
            _ => panic!("open succeeded with nothing registered"),
        }
    }

    #[test]
    fn samples_route_to_the_counter_owning_their_id() {
        let mut mux = routed_mux();
        match mux.attribute_sample(None, sample_with_identifier(2)) {
            MuxEvent::Sample { handle: 1, sample } => {
                assert_eq!(sample.identifier, Some(2));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mux.handles()[1].samples(), 1);
        assert_eq!(mux.handles()[0].samples(), 0);
        assert_eq!(mux.orphans(), 0);
    }

    #[test]
    fn unknown_ids_become_orphans_not_errors() {
        let mut mux = routed_mux();
        match mux.attribute_sample(None, sample_with_identifier(99)) {
            MuxEvent::Orphan { sample } => {
                assert_eq!(sample.identifier, Some(99));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mux.orphans(), 1);
        // The set keeps routing afterwards.
        match mux.attribute_sample(None, sample_with_identifier(1)) {
            MuxEvent::Sample { handle: 0, .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn idless_samples_default_to_a_lone_counter() {
        let mut mux = EventMux::with_defaults();
        mux.register(spec("solo", 0)).unwrap();
        mux.opened = true;
        match mux.attribute_sample(None, Sample::default()) {
            MuxEvent::Sample { handle: 0, .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn idless_samples_orphan_in_a_multi_counter_set() {
        let mut mux = routed_mux();
        match mux.attribute_sample(None, Sample::default()) {
            MuxEvent::Orphan { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn stream_ids_look_up_their_counter() {
        let mux = routed_mux();
        assert_eq!(mux.lookup(1).map(|h| h.index()), Some(0));
        assert_eq!(mux.lookup(2).map(|h| h.name()), Some("faults"));
        assert!(mux.lookup(3).is_none());
    }

    #[test]
    fn forced_identifiers_only_apply_to_mixed_shared_rings() {
        let mut mux = EventMux::with_defaults();
        mux.register(spec("solo", flag::TIME)).unwrap();
        mux.finalize_attrs();
        // A lone counter keeps its layout untouched.
        assert_eq!(mux.handles[0].layout.sample_type(), flag::TIME);
        assert!(!mux.handles[0].layout.sample_id_all());
        assert_ne!(mux.handles[0].attr.read_format & sys::PERF_FORMAT_ID as u64, 0);

        let mut mux = EventMux::with_defaults();
        mux.register(spec("a", flag::TIME)).unwrap();
        mux.register(spec("b", flag::TIME | flag::ADDR)).unwrap();
        mux.finalize_attrs();
        for handle in mux.handles() {
            assert_ne!(handle.layout().sample_type() & flag::IDENTIFIER, 0);
            assert!(handle.layout().sample_id_all());
        }
    }

    #[test]
    fn uniform_decode_needs_every_layout_to_agree() {
        let mut mux = EventMux::with_defaults();
        mux.register(spec("a", flag::TIME)).unwrap();
        mux.register(spec("b", flag::TIME)).unwrap();
        mux.register(spec("c", flag::TIME | flag::CPU)).unwrap();

        assert_eq!(mux.common_layout(&[0, 1]), Some(mux.handles[0].layout));
        assert_eq!(mux.common_layout(&[0, 1, 2]), None);
        // Agreement is judged over the counters that actually opened.
        assert_eq!(mux.common_layout(&[1, 2]), None);
        assert_eq!(mux.common_layout(&[2]), Some(mux.handles[2].layout));
        assert_eq!(mux.common_layout(&[]), None);
    }
}
