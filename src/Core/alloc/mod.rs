use crate::error::{Result, ShmError};
use crate::Core::futex::FutexLock;
use crate::Core::SharedMemory::SharedMemoryBackend;
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
mod debug;
mod getters;

const MAGIC_NUMBER: u64 = 0x444D58505F534D47; // "DMXP_SMG"
const LAYOUT_VERSION: u32 = 2;

/// Alignment of every block (and therefore every chunk payload).
pub const CHUNK_ALIGN: usize = 16;

/// In-band header in front of every block, allocated or free.
const BLOCK_HEADER: usize = std::mem::size_of::<BlockHeader>();

/// Tag of a block currently handed out by `allocate`.
const BLOCK_LIVE: u64 = 0x4B4C425F4556494C; // "LIVE_BLK"
/// Tag of a block on the free list. Headers merged away by coalescing get 0.
const BLOCK_FREE: u64 = 0x4B4C425F45455246; // "FREE_BLK"

/// Smallest remainder worth splitting off as a separate free block.
const MIN_BLOCK: usize = BLOCK_HEADER + CHUNK_ALIGN;

/// Offset of the first block: the arena header rounded up to the block alignment.
pub const HEADER_SIZE: usize =
    (std::mem::size_of::<ArenaHeader>() + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1);

/// Process-shared allocator interface the message layer is written against.
///
/// Implementations must be safe under concurrent use from many threads and
/// from every process that has the same arena mapped.
pub trait ArenaManager: Send + Sync {
    /// Reserve `size` bytes. `ShmError::Exhausted` means "try again later";
    /// `ShmError::TooLarge` means the request can never be satisfied.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Return a block previously handed out by `allocate`.
    fn deallocate(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Translate a local address to a handle valid in every attached process.
    fn handle_from_address(&self, ptr: NonNull<u8>) -> Result<isize>;

    /// Translate a handle back to an address in this process.
    ///
    /// Only handles of live allocations translate.
    fn address_from_handle(&self, handle: isize) -> Result<NonNull<u8>>;

    /// Usable bytes behind the live allocation at `handle`.
    fn payload_capacity(&self, handle: isize) -> Result<usize>;
}

/// Control block at the very beginning of the arena segment.
///
/// Everything except `lock` is only read or written while `lock` is held.
#[repr(C, align(128))]
pub struct ArenaHeader {
    /// A "magic number" identifying the segment as a message arena.
    pub magic: u64,

    /// The version of the memory layout.
    pub version: u32,

    /// Reserved/padding.
    pub reserved: u32,

    /// Usable size of the segment in bytes (multiple of CHUNK_ALIGN).
    pub capacity: u64,

    /// Offset of the first free block, 0 if none. The list is address-ordered.
    pub free_head: u64,

    /// Bytes held by live blocks, block headers included.
    pub used_bytes: u64,

    /// Number of live blocks.
    pub allocation_count: u64,

    /// Cross-process futex word guarding the fields above.
    pub lock: CachePadded<AtomicU32>,
}

#[repr(C)]
struct BlockHeader {
    /// Total block size including this header.
    size: u64,
    /// Next free block offset while on the free list, 0 otherwise.
    next_free: u64,
    /// `BLOCK_LIVE` or `BLOCK_FREE`.
    tag: u64,
    reserved: u64,
}

/// Default message arena: a named shared memory segment carved into blocks
/// by a first-fit free list that lives inside the segment itself.
///
/// Handles are payload offsets from the segment base, so they mean the same
/// thing in every process regardless of where the segment is mapped.
pub struct ShmArena {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut ArenaHeader,
    owner: bool,
}

impl ShmArena {
    /// Create and initialize a fresh arena segment.
    ///
    /// The creating instance unlinks the segment name when dropped.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let capacity = size & !(CHUNK_ALIGN - 1);
        if capacity < HEADER_SIZE + MIN_BLOCK {
            return Err(ShmError::Segment(format!(
                "ShmArena::create(): size too small. Requested: {}, Needed: {}",
                size,
                HEADER_SIZE + MIN_BLOCK
            )));
        }

        let shm = crate::Core::SharedMemory::create_shared_memory(capacity, name)?;
        let header = shm.as_ptr() as *mut ArenaHeader;

        unsafe {
            std::ptr::write(
                header,
                ArenaHeader {
                    magic: MAGIC_NUMBER,
                    version: LAYOUT_VERSION,
                    reserved: 0,
                    capacity: capacity as u64,
                    free_head: HEADER_SIZE as u64,
                    used_bytes: 0,
                    allocation_count: 0,
                    lock: CachePadded::new(AtomicU32::new(0)),
                },
            );
            // One free block spanning everything after the header
            std::ptr::write(
                shm.as_ptr().add(HEADER_SIZE) as *mut BlockHeader,
                BlockHeader {
                    size: (capacity - HEADER_SIZE) as u64,
                    next_free: 0,
                    tag: BLOCK_FREE,
                    reserved: 0,
                },
            );
        }

        tracing::debug!(name, capacity, "initialized message arena");
        Ok(Self {
            shm,
            header,
            owner: true,
        })
    }

    /// Attach to an arena another process created.
    pub fn attach(name: &str) -> Result<Self> {
        let shm = crate::Core::SharedMemory::attach_shared_memory(name)?;
        if shm.size() < HEADER_SIZE {
            return Err(ShmError::Segment(
                "Shared memory too small for arena header".into(),
            ));
        }

        let header = shm.as_ptr() as *mut ArenaHeader;
        unsafe {
            if (*header).magic != MAGIC_NUMBER {
                return Err(ShmError::Segment(
                    "Invalid magic number - arena not initialized".into(),
                ));
            }
            if (*header).version != LAYOUT_VERSION {
                return Err(ShmError::Segment(format!(
                    "Unsupported arena layout version {}",
                    (*header).version
                )));
            }
            if (*header).capacity as usize > shm.size() {
                return Err(ShmError::Segment(
                    "Arena capacity exceeds mapped segment".into(),
                ));
            }
        }

        tracing::debug!(name, "attached message arena");
        Ok(Self {
            shm,
            header,
            owner: false,
        })
    }

    fn lock(&self) -> FutexLock<'_> {
        FutexLock::new(unsafe { &*(*self.header).lock })
    }

    fn capacity_bytes(&self) -> usize {
        unsafe { (*self.header).capacity as usize }
    }

    #[inline]
    unsafe fn block(&self, offset: u64) -> *mut BlockHeader {
        self.shm.as_ptr().add(offset as usize) as *mut BlockHeader
    }

    /// Smallest block able to carry `size` payload bytes.
    fn block_size_for(size: usize) -> Option<usize> {
        let payload = size.max(1).checked_add(CHUNK_ALIGN - 1)? & !(CHUNK_ALIGN - 1);
        payload.checked_add(BLOCK_HEADER)
    }

    fn valid_payload_offset(&self, offset: usize) -> bool {
        offset >= HEADER_SIZE + BLOCK_HEADER
            && offset < self.capacity_bytes()
            && (offset - HEADER_SIZE) % CHUNK_ALIGN == 0
    }

    /// Offset and header of the live block whose payload starts at `handle`.
    ///
    /// The arena lock must be held.
    unsafe fn live_block(&self, handle: isize) -> Result<(u64, *mut BlockHeader)> {
        if handle <= 0 || !self.valid_payload_offset(handle as usize) {
            return Err(ShmError::InvalidHandle(handle));
        }
        let offset = (handle as usize - BLOCK_HEADER) as u64;
        let blk = self.block(offset);
        let size = (*blk).size;
        let fits = size >= MIN_BLOCK as u64
            && offset
                .checked_add(size)
                .map_or(false, |end| end <= self.capacity_bytes() as u64);
        if (*blk).tag != BLOCK_LIVE || !fits {
            return Err(ShmError::InvalidHandle(handle));
        }
        Ok((offset, blk))
    }
}

impl ArenaManager for ShmArena {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let usable = self.capacity_bytes() - HEADER_SIZE;
        let need = Self::block_size_for(size)
            .filter(|need| *need <= usable)
            .ok_or(ShmError::TooLarge {
                requested: size,
                capacity: usable - BLOCK_HEADER,
            })?;

        let lock = self.lock();
        let _guard = lock.lock();

        unsafe {
            let header = self.header;
            let mut prev: u64 = 0;
            let mut cur = (*header).free_head;

            while cur != 0 {
                let blk = self.block(cur);
                let block_size = (*blk).size as usize;

                if block_size >= need {
                    let next = (*blk).next_free;
                    let replacement = if block_size - need >= MIN_BLOCK {
                        let split = cur + need as u64;
                        std::ptr::write(
                            self.block(split),
                            BlockHeader {
                                size: (block_size - need) as u64,
                                next_free: next,
                                tag: BLOCK_FREE,
                                reserved: 0,
                            },
                        );
                        (*blk).size = need as u64;
                        split
                    } else {
                        next
                    };

                    if prev == 0 {
                        (*header).free_head = replacement;
                    } else {
                        (*self.block(prev)).next_free = replacement;
                    }
                    (*blk).next_free = 0;
                    (*blk).tag = BLOCK_LIVE;
                    (*header).used_bytes += (*blk).size;
                    (*header).allocation_count += 1;

                    let payload = self.shm.as_ptr().add(cur as usize + BLOCK_HEADER);
                    return NonNull::new(payload)
                        .ok_or_else(|| ShmError::Segment("null payload address".into()));
                }

                prev = cur;
                cur = (*blk).next_free;
            }
        }

        Err(ShmError::Exhausted { requested: size })
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let handle = self.handle_from_address(ptr)?;

        let lock = self.lock();
        let _guard = lock.lock();

        unsafe {
            let header = self.header;
            let (offset, blk) = self.live_block(handle)?;
            let size = (*blk).size;

            let (used_bytes, allocation_count) = match (
                (*header).used_bytes.checked_sub(size),
                (*header).allocation_count.checked_sub(1),
            ) {
                (Some(used), Some(count)) => (used, count),
                _ => {
                    return Err(ShmError::Segment(format!(
                        "arena counters out of sync freeing handle {}",
                        handle
                    )))
                }
            };

            // Find the address-ordered insertion point
            let mut prev: u64 = 0;
            let mut cur = (*header).free_head;
            while cur != 0 && cur < offset {
                prev = cur;
                cur = (*self.block(cur)).next_free;
            }

            let overlaps_prev = prev != 0 && prev + (*self.block(prev)).size > offset;
            let overlaps_next = cur != 0 && offset + size > cur;
            if cur == offset || overlaps_prev || overlaps_next {
                return Err(ShmError::Segment(format!(
                    "arena handle {} overlaps a free block",
                    handle
                )));
            }

            (*blk).tag = BLOCK_FREE;
            (*blk).next_free = cur;
            if prev == 0 {
                (*header).free_head = offset;
            } else {
                (*self.block(prev)).next_free = offset;
            }
            (*header).used_bytes = used_bytes;
            (*header).allocation_count = allocation_count;

            // Merge with the following block
            if cur != 0 && offset + (*blk).size == cur {
                let next = self.block(cur);
                (*blk).size += (*next).size;
                (*blk).next_free = (*next).next_free;
                (*next).tag = 0;
            }

            // Merge into the preceding block
            if prev != 0 {
                let before = self.block(prev);
                if prev + (*before).size == offset {
                    (*before).size += (*blk).size;
                    (*before).next_free = (*blk).next_free;
                    (*blk).tag = 0;
                }
            }
        }

        Ok(())
    }

    fn handle_from_address(&self, ptr: NonNull<u8>) -> Result<isize> {
        let base = self.shm.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        let offset = addr.wrapping_sub(base);
        if addr < base || !self.valid_payload_offset(offset) {
            return Err(ShmError::InvalidHandle(offset as isize));
        }
        Ok(offset as isize)
    }

    fn address_from_handle(&self, handle: isize) -> Result<NonNull<u8>> {
        let lock = self.lock();
        let _guard = lock.lock();

        unsafe { self.live_block(handle)? };
        let ptr = unsafe { self.shm.as_ptr().add(handle as usize) };
        NonNull::new(ptr).ok_or(ShmError::InvalidHandle(handle))
    }

    fn payload_capacity(&self, handle: isize) -> Result<usize> {
        let lock = self.lock();
        let _guard = lock.lock();

        let (_, blk) = unsafe { self.live_block(handle)? };
        Ok(unsafe { (*blk).size } as usize - BLOCK_HEADER)
    }
}

impl Drop for ShmArena {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = crate::Core::SharedMemory::remove_shared_memory(self.shm.name()) {
                tracing::warn!(
                    name = self.shm.name(),
                    error = %e,
                    "failed to unlink arena segment"
                );
            }
        }
    }
}

// Synchronization of the shared header is done by the in-segment futex lock
unsafe impl Send for ShmArena {}
unsafe impl Sync for ShmArena {}
