// Shared test fixtures: a heap-backed stand-in for the shared memory arena.
#![allow(dead_code)]

use dmxp_shmsg::Core::{ArenaManager, RegionRegistry, ShutdownSignal, UnmanagedRegion};
use dmxp_shmsg::SHM::TransportContext;
use dmxp_shmsg::{Result, ShmError};
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bump allocator over one heap block, with knobs for exhaustion and
/// address translation so tests can observe what the message layer does.
pub struct HeapArena {
    base: NonNull<u8>,
    layout: Layout,
    state: Mutex<HeapState>,
    exhausted: AtomicBool,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    failed_deallocations: AtomicUsize,
    translations: AtomicUsize,
    translation_shift: AtomicUsize,
}

struct HeapState {
    next: usize,
    live: HashMap<isize, usize>,
}

unsafe impl Send for HeapArena {}
unsafe impl Sync for HeapArena {}

impl HeapArena {
    pub fn new(capacity: usize) -> Arc<Self> {
        let layout = Layout::from_size_align(capacity, 16).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("heap arena allocation");
        Arc::new(Self {
            base,
            layout,
            // Offset 0 is never handed out so a handle of 0 stays "unset"
            state: Mutex::new(HeapState {
                next: 16,
                live: HashMap::new(),
            }),
            exhausted: AtomicBool::new(false),
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            failed_deallocations: AtomicUsize::new(0),
            translations: AtomicUsize::new(0),
            translation_shift: AtomicUsize::new(0),
        })
    }

    /// Make every allocation report "no space" until cleared.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }

    /// Stub translation: later `address_from_handle` calls return an address
    /// shifted by `shift` bytes.
    pub fn set_translation_shift(&self, shift: usize) {
        self.translation_shift.store(shift, Ordering::SeqCst);
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::SeqCst)
    }

    pub fn failed_deallocations(&self) -> usize {
        self.failed_deallocations.load(Ordering::SeqCst)
    }

    pub fn translations(&self) -> usize {
        self.translations.load(Ordering::SeqCst)
    }

    pub fn live_chunks(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live(&self, handle: isize) -> bool {
        self.state.lock().live.contains_key(&handle)
    }
}

impl ArenaManager for HeapArena {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(ShmError::Exhausted { requested: size });
        }
        let mut state = self.state.lock();
        let rounded = (size.max(1) + 15) & !15;
        if state.next + rounded > self.layout.size() {
            return Err(ShmError::Exhausted { requested: size });
        }
        let offset = state.next;
        state.next += rounded;
        state.live.insert(offset as isize, size);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let handle = self.handle_from_address(ptr)?;
        if self.state.lock().live.remove(&handle).is_none() {
            self.failed_deallocations.fetch_add(1, Ordering::SeqCst);
            return Err(ShmError::Segment(format!("double free of {}", handle)));
        }
        self.deallocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_from_address(&self, ptr: NonNull<u8>) -> Result<isize> {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        if offset == 0 || offset >= self.layout.size() {
            return Err(ShmError::InvalidHandle(offset as isize));
        }
        Ok(offset as isize)
    }

    fn address_from_handle(&self, handle: isize) -> Result<NonNull<u8>> {
        self.translations.fetch_add(1, Ordering::SeqCst);
        if handle <= 0 || handle as usize >= self.layout.size() {
            return Err(ShmError::InvalidHandle(handle));
        }
        let shift = self.translation_shift.load(Ordering::SeqCst);
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(handle as usize + shift)) })
    }

    fn payload_capacity(&self, handle: isize) -> Result<usize> {
        self.state
            .lock()
            .live
            .get(&handle)
            .copied()
            .ok_or(ShmError::InvalidHandle(handle))
    }
}

impl Drop for HeapArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Registry that knows no regions at all.
pub struct NoRegions;

impl RegionRegistry for NoRegions {
    fn get_region(&self, region_id: u32) -> Result<Arc<UnmanagedRegion>> {
        Err(ShmError::UnknownRegion(region_id))
    }
}

/// Context over `arena` with its own shutdown signal and a short poll interval.
pub fn heap_context(arena: &Arc<HeapArena>) -> TransportContext {
    heap_context_with_shutdown(arena, ShutdownSignal::new())
}

pub fn heap_context_with_shutdown(
    arena: &Arc<HeapArena>,
    shutdown: ShutdownSignal,
) -> TransportContext {
    TransportContext::new(
        Arc::clone(arena) as Arc<dyn ArenaManager>,
        Arc::new(NoRegions),
        shutdown,
        TEST_POLL_INTERVAL,
    )
}

/// Deterministic pseudo-random payload.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| rng.u8(..)).collect()
}
