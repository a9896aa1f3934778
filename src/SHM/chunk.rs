// Chunk identity, ownership, and the polling allocator on top of the arena

use crate::error::{Result, ShmError};
use crate::Core::alloc::ArenaManager;
use crate::Core::shutdown::ShutdownSignal;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// Default sleep between attempts while the arena is full.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a chunk lives: `(region_id, handle)`. Region 0 is the default arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub region_id: u32,
    pub handle: isize,
}

impl ChunkId {
    pub fn arena(handle: isize) -> Self {
        Self {
            region_id: 0,
            handle,
        }
    }

    pub fn in_region(region_id: u32, handle: isize) -> Self {
        Self { region_id, handle }
    }

    pub fn is_arena(&self) -> bool {
        self.region_id == 0
    }
}

/// Who is responsible for returning a chunk to the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// This message allocated (or was handed) a default-arena chunk and frees it on close.
    Owned,
    /// Ownership passed to the transport; close must not free.
    Transferred,
    /// Points into memory whose lifetime is managed elsewhere; never freed here.
    Referenced,
}

/// A chunk held by a message, tagged with its ownership.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShmChunk {
    pub id: ChunkId,
    pub size: usize,
    pub ownership: Ownership,
}

impl ShmChunk {
    /// Only an owned default-arena chunk may be deallocated.
    pub fn must_release(&self) -> bool {
        self.id.is_arena() && self.ownership == Ownership::Owned
    }
}

/// A freshly allocated default-arena chunk plus its local address.
#[derive(Debug)]
pub struct AllocatedChunk {
    pub chunk: ShmChunk,
    pub ptr: NonNull<u8>,
}

/// Allocates default-arena chunks, polling while the arena is exhausted.
///
/// There is no wake-up on free: other processes draining their messages is
/// the only flow control, so the allocator sleeps `poll_interval` between
/// attempts until memory shows up or `shutdown` is triggered.
#[derive(Clone)]
pub struct ChunkAllocator {
    arena: Arc<dyn ArenaManager>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
}

impl ChunkAllocator {
    pub fn new(
        arena: Arc<dyn ArenaManager>,
        shutdown: ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            arena,
            shutdown,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Allocate `size` bytes, blocking while the arena is full.
    ///
    /// # Returns
    /// * `Ok(chunk)` owned by the caller
    /// * `Err(ShmError::Aborted)` if shutdown was signalled while waiting
    /// * any non-transient arena error as is, e.g. `ShmError::TooLarge`
    pub fn allocate(&self, size: usize) -> Result<AllocatedChunk> {
        let mut attempts: u64 = 0;

        loop {
            match self.arena.allocate(size) {
                Ok(ptr) => {
                    let handle = match self.arena.handle_from_address(ptr) {
                        Ok(handle) => handle,
                        Err(e) => {
                            // Do not leak a block we cannot describe
                            if let Err(free_err) = self.arena.deallocate(ptr) {
                                tracing::error!(
                                    error = %free_err,
                                    "failed to return untranslatable block"
                                );
                            }
                            return Err(e);
                        }
                    };
                    if attempts > 0 {
                        tracing::debug!(size, attempts, "allocation succeeded after waiting");
                    }
                    return Ok(AllocatedChunk {
                        chunk: ShmChunk {
                            id: ChunkId::arena(handle),
                            size,
                            ownership: Ownership::Owned,
                        },
                        ptr,
                    });
                }
                Err(ShmError::Exhausted { .. }) => {
                    if self.shutdown.is_triggered() {
                        tracing::warn!(size, attempts, "allocation abandoned: shutdown signalled");
                        return Err(ShmError::Aborted);
                    }
                    if attempts == 0 {
                        tracing::debug!(size, "shared memory full, waiting for free space");
                    } else {
                        tracing::trace!(size, attempts, "shared memory still full");
                    }
                    attempts += 1;
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return an owned default-arena chunk.
    pub fn release(&self, chunk: &ShmChunk) -> Result<()> {
        if !chunk.must_release() {
            return Err(ShmError::Segment(format!(
                "refusing to release {:?} chunk in region {}",
                chunk.ownership, chunk.id.region_id
            )));
        }
        let ptr = self.arena.address_from_handle(chunk.id.handle)?;
        self.arena.deallocate(ptr)
    }
}
