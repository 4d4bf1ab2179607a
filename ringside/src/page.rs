//! Access to the shared counter control page.
//!
//! The first page of every ring-buffer mapping is a `perf_event_mmap_page`
//! the kernel updates in place: counter state and time scaling factors are
//! guarded by a sequence count (`lock`), while `data_head`/`data_tail`
//! form an acquire/release pair with the producer. All cross-side fields
//! are read through volatile or atomic operations; nothing here may be
//! accessed through a plain `&` reference, since the producer mutates the
//! page at any time.

use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use perf_event_open_sys::bindings::perf_event_mmap_page;

use crate::errors::SelfReadError;

/// Passes of the sequence-count loop tolerated before the page is declared
/// wedged. A writer section is a handful of stores; values anywhere near
/// this bound mean the producer died mid-update or the memory is corrupt.
pub(crate) const SEQ_RETRY_LIMIT: u32 = 10_000;

/// A non-owning view of a mapped `perf_event_mmap_page`.
///
/// Constructing one is unsafe: the pointer must refer to a live mapping of
/// at least one page, and must stay mapped for as long as the view (or any
/// copy of it) is used. All methods are then safe; any of them may race
/// with concurrent kernel updates, which the page protocol tolerates.
#[derive(Clone, Copy)]
pub struct ControlPage {
    page: *mut perf_event_mmap_page,
}

impl ControlPage {
    /// Wraps a raw pointer to a mapped control page.
    ///
    /// # Safety
    ///
    /// `page` must point to a readable and writable mapping of a
    /// `perf_event_mmap_page` that outlives every copy of the returned
    /// view.
    pub unsafe fn from_ptr(page: *mut perf_event_mmap_page) -> ControlPage {
        ControlPage { page }
    }

    fn head_atomic(&self) -> &AtomicU64 {
        unsafe { &*(ptr::addr_of!((*self.page).data_head) as *const AtomicU64) }
    }

    fn tail_atomic(&self) -> &AtomicU64 {
        unsafe { &*(ptr::addr_of!((*self.page).data_tail) as *const AtomicU64) }
    }

    /// Bytes the producer has published so far, as a free-running logical
    /// offset. Pairs with the producer's release store, so every record
    /// byte below the returned value is visible after this call.
    pub fn data_head(&self) -> u64 {
        self.head_atomic().load(Ordering::Acquire)
    }

    /// The consumer position last published through [`set_data_tail`].
    ///
    /// [`set_data_tail`]: ControlPage::set_data_tail
    pub fn data_tail(&self) -> u64 {
        self.tail_atomic().load(Ordering::Relaxed)
    }

    /// Publishes the consumer position, releasing all reads of record
    /// bytes performed before the call. The kernel will not overwrite ring
    /// space below `tail` afterwards.
    pub fn set_data_tail(&self, tail: u64) {
        self.tail_atomic().store(tail, Ordering::Release);
    }

    pub fn version(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).version)) }
    }

    pub fn compat_version(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).compat_version)) }
    }

    /// Whether the kernel allows reading the counter register directly
    /// from userspace on this mapping.
    pub fn user_register_access(&self) -> bool {
        let caps = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).__bindgen_anon_1)) };
        let caps = unsafe { caps.__bindgen_anon_1 };
        caps.cap_user_rdpmc() != 0
    }

    pub(crate) fn index(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).index)) }
    }

    pub(crate) fn offset(&self) -> i64 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).offset)) }
    }

    pub(crate) fn time_enabled(&self) -> u64 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).time_enabled)) }
    }

    pub(crate) fn time_running(&self) -> u64 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).time_running)) }
    }

    pub(crate) fn time_mult(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).time_mult)) }
    }

    pub(crate) fn time_shift(&self) -> u16 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).time_shift)) }
    }

    pub(crate) fn time_offset(&self) -> u64 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).time_offset)) }
    }

    pub(crate) fn pmc_width(&self) -> u16 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).pmc_width)) }
    }

    /// First half of the sequence-count bracket. The kernel increments
    /// `lock` before and after each update, so an odd value means a writer
    /// is mid-update.
    pub(crate) fn seq_begin(&self) -> u32 {
        let seq = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).lock)) };
        fence(Ordering::Acquire);
        seq
    }

    /// Second half of the bracket; orders all field reads before the
    /// re-read of the sequence count.
    pub(crate) fn seq_end(&self) -> u32 {
        fence(Ordering::Acquire);
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).lock)) }
    }
}

/// One sequence-guarded read section. Split from [`ControlPage`] so the
/// loop can also bracket reads from any field source, not just a raw page.
pub(crate) trait SeqGuard {
    fn seq_begin(&self) -> u32;
    fn seq_end(&self) -> u32;
}

impl SeqGuard for ControlPage {
    fn seq_begin(&self) -> u32 {
        ControlPage::seq_begin(self)
    }

    fn seq_end(&self) -> u32 {
        ControlPage::seq_end(self)
    }
}

/// Retries `attempt` until a stable, even sequence count brackets it.
///
/// Gives up after [`SEQ_RETRY_LIMIT`] passes rather than spinning forever
/// on a page whose producer will never complete its update.
pub(crate) fn read_seq_guarded<G: SeqGuard, S, T>(
    guard: &G,
    source: &S,
    mut attempt: impl FnMut(&S) -> T,
) -> Result<T, SelfReadError> {
    for _ in 0..SEQ_RETRY_LIMIT {
        let seq = guard.seq_begin();
        let result = attempt(source);
        if guard.seq_end() == seq && seq & 1 == 0 {
            return Ok(result);
        }
    }
    Err(SelfReadError::PageInconsistent { retries: SEQ_RETRY_LIMIT })
}
