//! Syscall-free counter value reads off the control page.
//!
//! When the kernel grants userspace register access, the current value of
//! a counter can be assembled entirely from the mapped control page: the
//! accumulated `offset`, plus the live hardware register named by `index`,
//! scaled by the enabled/running times to compensate for multiplexing.
//! All page fields involved are guarded by the page's sequence count, so
//! the whole snapshot is taken inside one sequence-guarded section and the
//! arithmetic happens on a consistent copy afterwards.
//!
//! The protocol for a single read:
//!
//! 1. bracket with the sequence count (retry on change or odd count),
//! 2. copy `time_enabled`/`time_running`; if they differ, also copy the
//!    time scaling triple and sample the timestamp counter now,
//! 3. copy `offset`, and if `index` is nonzero add the sign-extended
//!    hardware register `index - 1`,
//! 4. outside the bracket, extend both times by the elapsed cycles and
//!    apportion the count from running time to enabled time.

use std::marker::PhantomData;

use crate::errors::SelfReadError;
use crate::page::{read_seq_guarded, ControlPage, SeqGuard};

/// Everything a scaled read needs from a control page.
///
/// [`ControlPage`] is the one real source; the indirection keeps the read
/// loop independent of how the fields are produced.
pub(crate) trait CounterPage: SeqGuard {
    fn index(&self) -> u32;
    fn offset(&self) -> i64;
    fn time_enabled(&self) -> u64;
    fn time_running(&self) -> u64;
    fn time_mult(&self) -> u32;
    fn time_shift(&self) -> u16;
    fn time_offset(&self) -> u64;
    fn pmc_width(&self) -> u16;
    /// Reads hardware counter register `reg` (already adjusted down from
    /// the page's one-based `index`).
    fn counter_register(&self, reg: u32) -> u64;
    /// Samples the timestamp counter.
    fn timestamp(&self) -> u64;
}

impl CounterPage for ControlPage {
    fn index(&self) -> u32 {
        ControlPage::index(self)
    }

    fn offset(&self) -> i64 {
        ControlPage::offset(self)
    }

    fn time_enabled(&self) -> u64 {
        ControlPage::time_enabled(self)
    }

    fn time_running(&self) -> u64 {
        ControlPage::time_running(self)
    }

    fn time_mult(&self) -> u32 {
        ControlPage::time_mult(self)
    }

    fn time_shift(&self) -> u16 {
        ControlPage::time_shift(self)
    }

    fn time_offset(&self) -> u64 {
        ControlPage::time_offset(self)
    }

    fn pmc_width(&self) -> u16 {
        ControlPage::pmc_width(self)
    }

    fn counter_register(&self, reg: u32) -> u64 {
        hw::counter_register(reg)
    }

    fn timestamp(&self) -> u64 {
        hw::timestamp_counter()
    }
}

/// Cycle-to-nanosecond conversion parameters, valid only for the sequence
/// window they were copied in.
struct TimeScale {
    cycles: u64,
    mult: u32,
    shift: u16,
    offset: u64,
}

/// One consistent copy of the counter state.
struct Snapshot {
    enabled: u64,
    running: u64,
    scheduled: bool,
    scale: Option<TimeScale>,
    count: u64,
}

fn snapshot<P: CounterPage>(page: &P) -> Snapshot {
    let enabled = page.time_enabled();
    let running = page.time_running();

    // The timestamp must come from inside the bracket: the scaling triple
    // is only meaningful relative to when the kernel last updated the
    // page, and the bracket is what ties the two together.
    let scale = if enabled != running {
        Some(TimeScale {
            cycles: page.timestamp(),
            mult: page.time_mult(),
            shift: page.time_shift(),
            offset: page.time_offset(),
        })
    } else {
        None
    };

    let index = page.index();
    let mut count = page.offset() as u64;
    if index != 0 {
        let raw = page.counter_register(index - 1);
        count = count.wrapping_add(sign_extend(raw, page.pmc_width()));
    }

    Snapshot { enabled, running, scheduled: index != 0, scale, count }
}

fn scale_snapshot(snap: Snapshot) -> u64 {
    let Snapshot { mut enabled, mut running, scheduled, scale, count } = snap;

    let scale = match scale {
        Some(scale) => scale,
        None => return count,
    };

    let delta = elapsed_ns(scale.cycles, scale.mult, scale.shift, scale.offset);
    enabled = enabled.wrapping_add(delta);
    if scheduled {
        running = running.wrapping_add(delta);
    }

    // A counter that was enabled but never scheduled has nothing to
    // extrapolate from.
    if running == 0 {
        return 0;
    }

    rescale(count, enabled, running)
}

pub(crate) fn read_scaled<P: CounterPage>(page: &P) -> Result<u64, SelfReadError> {
    let snap = read_seq_guarded(page, page, snapshot)?;
    Ok(scale_snapshot(snap))
}

/// Converts a timestamp-counter value to nanoseconds since the producer
/// last refreshed the scaling triple.
///
/// Splitting `cycles` at `shift` keeps the products in 64 bits for any
/// realistic uptime; the sum equals `offset + (cycles * mult) >> shift`
/// exactly.
fn elapsed_ns(cycles: u64, mult: u32, shift: u16, offset: u64) -> u64 {
    // The shift is producer-controlled; clamp it to a defined range.
    let shift = u32::from(shift) & 63;
    let quot = cycles >> shift;
    let rem = cycles & ((1u64 << shift) - 1);
    offset
        .wrapping_add(quot.wrapping_mul(u64::from(mult)))
        .wrapping_add(rem.wrapping_mul(u64::from(mult)) >> shift)
}

/// Extrapolates `count` from `running` nanoseconds of collection to
/// `enabled` nanoseconds, apportioned so the intermediate products stay
/// in range. Equals `count * enabled / running` whenever that quantity
/// fits in 64 bits. `running` must be nonzero.
fn rescale(count: u64, enabled: u64, running: u64) -> u64 {
    let quot = count / running;
    let rem = count % running;
    quot.wrapping_mul(enabled)
        .wrapping_add(rem.wrapping_mul(enabled) / running)
}

/// Sign-extends a `width`-bit hardware register value to 64 bits.
///
/// Counter registers are narrower than 64 bits (48 is typical) and the
/// kernel pre-biases `offset` assuming the sign-extended reading.
fn sign_extend(raw: u64, width: u16) -> u64 {
    if width == 0 || width >= 64 {
        return raw;
    }
    let shift = 64 - u32::from(width);
    (((raw << shift) as i64) >> shift) as u64
}

/// Reads a counter's current scaled value without entering the kernel.
///
/// Borrowed from the mapping that owns the control page; reads may happen
/// any number of times and never block. Values move with the counter, so
/// two reads bracketing a region of interest give its cost by difference.
pub struct SelfReader<'a> {
    page: ControlPage,
    _mapping: PhantomData<&'a ()>,
}

impl<'a> SelfReader<'a> {
    pub(crate) fn new(page: ControlPage) -> Result<SelfReader<'a>, SelfReadError> {
        if !page.user_register_access() {
            return Err(SelfReadError::NoUserRead);
        }
        if !hw::supported() {
            return Err(SelfReadError::Unsupported);
        }
        Ok(SelfReader { page, _mapping: PhantomData })
    }

    /// Current counter value, scaled to the counter's enabled time.
    pub fn read(&self) -> Result<u64, SelfReadError> {
        read_scaled(&self.page)
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod hw {
    use std::arch::asm;

    pub(super) fn supported() -> bool {
        true
    }

    /// Read the hardware performance counter indicated by `reg`.
    ///
    /// The raw register value is unsigned and `pmc_width` bits wide; the
    /// caller is responsible for sign extension.
    #[inline(always)]
    pub(super) fn counter_register(reg: u32) -> u64 {
        let (lo, hi): (u32, u32);
        unsafe {
            asm!(
                "rdpmc",
                in("ecx") reg,
                lateout("eax") lo,
                lateout("edx") hi,
                options(nostack),
                // AT&T syntax: older LLVM releases mishandle Intel
                // syntax inline asm.
                options(att_syntax),
            );
        }
        lo as u64 | (hi as u64) << 32
    }

    #[inline(always)]
    pub(super) fn timestamp_counter() -> u64 {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
mod hw {
    pub(super) fn supported() -> bool {
        false
    }

    pub(super) fn counter_register(_reg: u32) -> u64 {
        0
    }

    pub(super) fn timestamp_counter() -> u64 {
        0
    }
}
