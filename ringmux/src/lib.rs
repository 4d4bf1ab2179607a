//! Multiplexed consumption of hardware and software counter streams.
//!
//! This crate sits on top of `ringside`: where `ringside` maps and
//! decodes a single counter ring, `ringmux` owns a whole set of
//! counters, opens them across cpu and process contexts, funnels their
//! records through shared ring buffers, and hands every decoded record
//! back to the counter that produced it.
//!
//! The flow is registration, then open, then a poll loop:
//!
//! ```no_run
//! use perf_event_open_sys::bindings as sys;
//! use ringmux::{CounterSpec, EventMux, MuxEvent, Targets};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut attr = sys::perf_event_attr::default();
//! attr.type_ = sys::PERF_TYPE_SOFTWARE;
//! attr.config = sys::PERF_COUNT_SW_TASK_CLOCK as u64;
//! attr.__bindgen_anon_1.sample_period = 1_000_000;
//! attr.set_disabled(1);
//!
//! let mut mux = EventMux::with_defaults();
//! mux.register(CounterSpec::new("task-clock", attr))?;
//! mux.open(&Targets::this_process())?;
//! mux.enable_all()?;
//! loop {
//!     mux.wait(None)?;
//!     let events: Vec<MuxEvent> = mux.poll_all().collect();
//!     for event in events {
//!         if let MuxEvent::Sample { handle, sample } = event {
//!             println!("{}: ip {:?}", mux.handles()[handle].name(), sample.ip);
//!         }
//!     }
//! }
//! # }
//! ```
//!
//! Samples are matched to counters by the kernel stream ids collected at
//! open time; records that cannot be attributed surface as
//! [`MuxEvent::Orphan`] rather than disappearing.

pub mod errors;
pub mod handle;
pub mod mux;

pub use crate::errors::OpenError;
pub use crate::handle::{CounterHandle, CounterSpec, Targets};
pub use crate::mux::{Drain, EventMux, MuxConfig, MuxEvent, OpenReport, StreamStatus};
pub use ringside::MapConfig;
