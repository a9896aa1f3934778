use std::sync::atomic::{AtomicU32, Ordering};

// The lock word lives in MAP_SHARED memory, so the futex calls must not use
// FUTEX_PRIVATE_FLAG: waiters in other processes have to be woken too.

#[cfg(target_os = "linux")]
pub fn futex_wait(atomic: &AtomicU32, expected: u32) {
    use std::ptr;

    // Check condition first to avoid syscall if possible
    if atomic.load(Ordering::Relaxed) != expected {
        return;
    }

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(atomic: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            1, // Wake 1 waiter
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_atomic: &AtomicU32, _expected: u32) {
    // Fallback for non-Linux: busy wait with yield
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_atomic: &AtomicU32) {
    // No-op on non-Linux
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Cross-process mutex over a single `AtomicU32` placed in shared memory.
///
/// 0 = unlocked, 1 = locked, 2 = locked with waiters.
pub struct FutexLock<'a> {
    word: &'a AtomicU32,
}

/// Releases the [`FutexLock`] on drop.
pub struct FutexGuard<'a> {
    word: &'a AtomicU32,
}

impl<'a> FutexLock<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn lock(&self) -> FutexGuard<'a> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Mark contended and sleep until the holder hands it back
            while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                futex_wait(self.word, CONTENDED);
            }
        }
        FutexGuard { word: self.word }
    }
}

impl Drop for FutexGuard<'_> {
    fn drop(&mut self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(self.word);
        }
    }
}
