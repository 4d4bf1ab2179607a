//! Watches a task clock counter sampling the calling process and prints
//! every decoded record for a couple of seconds.
//!
//! Run with `cargo run --example watch`. Needs an environment where
//! unprivileged counter access is allowed.

use std::process;
use std::time::{Duration, Instant};

use perf_event_open_sys::bindings as sys;
use ringmux::{CounterSpec, EventMux, MuxEvent, Targets};
use ringside::sample::flag;

fn main() {
    let mut attr = sys::perf_event_attr::default();
    attr.type_ = sys::PERF_TYPE_SOFTWARE;
    attr.config = sys::PERF_COUNT_SW_TASK_CLOCK as u64;
    attr.__bindgen_anon_1.sample_period = 5_000_000;
    attr.sample_type = flag::IP | flag::TID | flag::TIME | flag::PERIOD;
    attr.__bindgen_anon_2.wakeup_events = 1;
    attr.set_disabled(1);
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);

    let mut mux = EventMux::with_defaults();
    if let Err(e) = run(&mut mux, CounterSpec::new("task-clock", attr)) {
        eprintln!("watch: {}", e);
        eprintln!(
            "hint: unprivileged counter access may be disabled; \
             check /proc/sys/kernel/perf_event_paranoid"
        );
        process::exit(1);
    }
}

fn run(mux: &mut EventMux, spec: CounterSpec) -> Result<(), Box<dyn std::error::Error>> {
    let index = mux.register(spec)?;
    let report = mux.open(&Targets::this_process())?;
    if let Some((_, err)) = report.failed.into_iter().next() {
        return Err(Box::new(err));
    }
    mux.enable_all()?;

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut spin = 0u64;
    while Instant::now() < deadline {
        for _ in 0..200_000 {
            spin = std::hint::black_box(spin.wrapping_mul(25214903917).wrapping_add(11));
        }
        mux.wait(Some(Duration::from_millis(50)))?;
        let events: Vec<MuxEvent> = mux.poll_all().collect();
        for event in events {
            match event {
                MuxEvent::Sample { handle, sample } => {
                    println!(
                        "{}: time {:>12} ip {:#014x} period {}",
                        mux.handles()[handle].name(),
                        sample.time.unwrap_or(0),
                        sample.ip.unwrap_or(0),
                        sample.period.unwrap_or(0),
                    );
                }
                MuxEvent::Orphan { sample } => {
                    println!("orphan sample, stream id {:?}", sample.routing_id());
                }
                MuxEvent::Side { record, .. } => println!("side record: {:?}", record),
                MuxEvent::Fault { stream, error } => {
                    eprintln!("stream {} fault: {}", stream, error);
                }
            }
        }
    }
    mux.disable_all()?;

    println!("{} samples total", mux.handles()[index].samples());
    for status in mux.stream_status() {
        println!(
            "stream {}: {} records, {} bytes consumed",
            status.stream, status.records, status.bytes
        );
    }
    Ok(())
}
