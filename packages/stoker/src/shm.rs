//! The process-shared region: one accept lock followed by the worker
//! descriptor slots. Mapped anonymously with MAP_SHARED before any fork so
//! every process sees the same pages. The region holds nothing but plain
//! atomics and fixed byte fields; no owned pointers cross process
//! boundaries.

use std::ffi::c_void;
use std::mem::{align_of, size_of};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};

use log::warn;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::error::{Result, StokerError};

const LOCK_FREE: u32 = 0;
const LOCK_HELD: u32 = 1;

/// The cross-process accept lock at the head of the shared region. The
/// lock word is the synchronization primitive; `current` is advisory
/// diagnostics for the reaper.
#[repr(C)]
pub struct AcceptLock {
    lock: AtomicU32,
    current: AtomicI32,
}

impl AcceptLock {
    pub fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.lock.store(LOCK_FREE, Ordering::Release);
    }

    /// Single compare-and-swap acquisition. The winner records its pid
    /// after the swap; losers retry on their next loop iteration.
    pub fn try_acquire(&self, pid: i32) -> bool {
        if self
            .lock
            .compare_exchange(LOCK_FREE, LOCK_HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.current.store(pid, Ordering::Relaxed);
        true
    }

    /// Clears the holder and frees the lock word. Returns false when the
    /// word was not held, which callers log and otherwise ignore.
    pub fn release(&self) -> bool {
        self.current.store(0, Ordering::Relaxed);
        self.lock
            .compare_exchange(LOCK_HELD, LOCK_FREE, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_held(&self) -> bool {
        self.lock.load(Ordering::Relaxed) == LOCK_HELD
    }

    pub fn holder(&self) -> i32 {
        self.current.load(Ordering::Relaxed)
    }
}

pub const HANDLER_NAME_MAX: usize = 64;
pub const LOG_BUF_LEN: usize = 512;

/// Per-worker record in the shared region. Lifecycle fields (`pid`,
/// `running`, `restarted`) are written only by the supervisor; `has_lock`,
/// the handler name and the log buffer only by the owning worker. No field
/// has two writers.
#[repr(C)]
pub struct SharedSlot {
    pid: AtomicI32,
    running: AtomicU32,
    has_lock: AtomicU32,
    restarted: AtomicU32,
    hdlr_len: AtomicU32,
    hdlr: [AtomicU8; HANDLER_NAME_MAX],
    lb_len: AtomicU32,
    lb: [AtomicU8; LOG_BUF_LEN],
}

impl SharedSlot {
    /// Supervisor-side wipe before (re)spawning into the slot.
    pub fn reset(&self) {
        self.pid.store(0, Ordering::Relaxed);
        self.running.store(0, Ordering::Relaxed);
        self.has_lock.store(0, Ordering::Relaxed);
        self.restarted.store(0, Ordering::Relaxed);
        self.hdlr_len.store(0, Ordering::Relaxed);
        self.lb_len.store(0, Ordering::Relaxed);
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, on: bool) {
        self.running.store(on as u32, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) != 0
    }

    pub fn set_has_lock(&self, on: bool) {
        self.has_lock.store(on as u32, Ordering::Relaxed);
    }

    pub fn has_lock(&self) -> bool {
        self.has_lock.load(Ordering::Relaxed) != 0
    }

    pub fn set_restarted(&self, on: bool) {
        self.restarted.store(on as u32, Ordering::Relaxed);
    }

    pub fn restarted(&self) -> bool {
        self.restarted.load(Ordering::Relaxed) != 0
    }

    /// Publishes the handler the worker is currently executing so the
    /// supervisor can attribute a crash. `None` clears it.
    pub fn set_active_handler(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                let bytes = name.as_bytes();
                let len = bytes.len().min(HANDLER_NAME_MAX);
                for (i, &b) in bytes[..len].iter().enumerate() {
                    self.hdlr[i].store(b, Ordering::Relaxed);
                }
                self.hdlr_len.store(len as u32, Ordering::Relaxed);
            }
            None => self.hdlr_len.store(0, Ordering::Relaxed),
        }
    }

    pub fn active_handler(&self) -> Option<String> {
        let len = (self.hdlr_len.load(Ordering::Relaxed) as usize).min(HANDLER_NAME_MAX);
        if len == 0 {
            return None;
        }
        let bytes: Vec<u8> = (0..len).map(|i| self.hdlr[i].load(Ordering::Relaxed)).collect();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Appends one diagnostic line to the slot's log buffer, truncating at
    /// capacity. Only the owning worker writes here.
    pub fn log_note(&self, line: &str) {
        let mut off = (self.lb_len.load(Ordering::Relaxed) as usize).min(LOG_BUF_LEN);
        for &b in line.as_bytes().iter().chain(std::iter::once(&b'\n')) {
            if off >= LOG_BUF_LEN {
                break;
            }
            self.lb[off].store(b, Ordering::Relaxed);
            off += 1;
        }
        self.lb_len.store(off as u32, Ordering::Relaxed);
    }

    /// Reads and clears the log buffer; the supervisor calls this when the
    /// worker died abnormally.
    pub fn drain_log(&self) -> String {
        let len = (self.lb_len.load(Ordering::Relaxed) as usize).min(LOG_BUF_LEN);
        let bytes: Vec<u8> = (0..len).map(|i| self.lb[i].load(Ordering::Relaxed)).collect();
        self.lb_len.store(0, Ordering::Relaxed);
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }
}

/// Owner of the anonymous shared mapping. Created once by the supervisor;
/// children inherit the same pages across fork.
pub struct SharedRegion {
    base: NonNull<c_void>,
    len: usize,
    slots: usize,
}

// The mapping is shared by design; everything reachable through it is an
// atomic.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn slots_offset() -> usize {
    let align = align_of::<SharedSlot>();
    size_of::<AcceptLock>().div_ceil(align) * align
}

impl SharedRegion {
    /// Maps and zero-initializes the region for `slots` worker records.
    /// Must run in the supervisor before any fork.
    pub fn create(slots: usize) -> Result<Self> {
        let len = slots_offset() + slots * size_of::<SharedSlot>();
        let len_nz =
            NonZeroUsize::new(len).ok_or(StokerError::SharedRegion(nix::Error::EINVAL))?;
        let base = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(StokerError::SharedRegion)?;

        // MAP_ANONYMOUS pages are zero-filled, which is a valid state for
        // every atomic in the region.
        let region = SharedRegion { base, len, slots };
        region.accept_lock().reset();
        Ok(region)
    }

    pub fn accept_lock(&self) -> &AcceptLock {
        unsafe { &*(self.base.as_ptr() as *const AcceptLock) }
    }

    pub fn slot(&self, idx: usize) -> &SharedSlot {
        assert!(idx < self.slots, "slot {idx} out of range");
        unsafe {
            let slots = self.base.as_ptr().cast::<u8>().add(slots_offset());
            &*slots.cast::<SharedSlot>().add(idx)
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            warn!("failed to unmap shared region: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    use super::*;

    #[test]
    fn lock_acquire_is_exclusive_and_release_frees() {
        let region = SharedRegion::create(4).expect("region");
        let lock = region.accept_lock();

        assert!(!lock.is_held());
        assert!(lock.try_acquire(100));
        assert!(lock.is_held());
        assert_eq!(lock.holder(), 100);

        // Second acquisition must lose.
        assert!(!lock.try_acquire(200));
        assert_eq!(lock.holder(), 100);

        assert!(lock.release());
        assert!(!lock.is_held());
        assert_eq!(lock.holder(), 0);

        // Releasing a free lock reports the mismatch.
        assert!(!lock.release());
    }

    #[test]
    fn lock_contention_has_at_most_one_holder() {
        let region = Arc::new(SharedRegion::create(4).expect("region"));
        let inside = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let region = Arc::clone(&region);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                let mut acquired = 0u32;
                for _ in 0..2000 {
                    if region.accept_lock().try_acquire(worker + 1) {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        acquired += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        assert!(region.accept_lock().release());
                    }
                }
                acquired
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert!(total > 0);
        assert!(!region.accept_lock().is_held());
    }

    #[test]
    fn slot_fields_round_trip() {
        let region = SharedRegion::create(3).expect("region");
        let slot = region.slot(2);

        slot.set_pid(4242);
        slot.set_running(true);
        slot.set_has_lock(true);
        slot.set_restarted(true);
        assert_eq!(slot.pid(), 4242);
        assert!(slot.is_running());
        assert!(slot.has_lock());
        assert!(slot.restarted());

        slot.reset();
        assert_eq!(slot.pid(), 0);
        assert!(!slot.is_running());
        assert!(!slot.has_lock());
        assert!(!slot.restarted());
    }

    #[test]
    fn active_handler_is_truncated_to_capacity() {
        let region = SharedRegion::create(1).expect("region");
        let slot = region.slot(0);

        assert_eq!(slot.active_handler(), None);
        slot.set_active_handler(Some("page_handler"));
        assert_eq!(slot.active_handler().as_deref(), Some("page_handler"));

        let long = "h".repeat(HANDLER_NAME_MAX * 2);
        slot.set_active_handler(Some(&long));
        assert_eq!(
            slot.active_handler().map(|s| s.len()),
            Some(HANDLER_NAME_MAX)
        );

        slot.set_active_handler(None);
        assert_eq!(slot.active_handler(), None);
    }

    #[test]
    fn log_buffer_appends_and_truncates() {
        let region = SharedRegion::create(1).expect("region");
        let slot = region.slot(0);

        slot.log_note("first");
        slot.log_note("second");
        assert_eq!(slot.drain_log(), "first\nsecond");
        assert_eq!(slot.drain_log(), "");

        let huge = "x".repeat(LOG_BUF_LEN * 2);
        slot.log_note(&huge);
        assert_eq!(slot.drain_log().len(), LOG_BUF_LEN);
    }
}
