use super::*;

/// Monitoring accessors for ShmArena
///
/// Counters are read under the arena lock so a snapshot is consistent
/// with concurrent allocations in other processes.
impl ShmArena {
    /// Name of the backing segment under /dev/shm
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Get the raw pointer to the ArenaHeader
    pub fn header_ptr(&self) -> *const ArenaHeader {
        self.header
    }

    /// Usable size of the arena in bytes, header included
    pub fn capacity(&self) -> usize {
        self.capacity_bytes()
    }

    /// Bytes held by live chunks, block headers included
    pub fn used_bytes(&self) -> usize {
        let lock = self.lock();
        let _guard = lock.lock();
        unsafe { (*self.header).used_bytes as usize }
    }

    /// Bytes not held by any live chunk (may be fragmented)
    pub fn free_bytes(&self) -> usize {
        (self.capacity_bytes() - HEADER_SIZE).saturating_sub(self.used_bytes())
    }

    /// Number of live chunks across all attached processes
    pub fn allocation_count(&self) -> u64 {
        let lock = self.lock();
        let _guard = lock.lock();
        unsafe { (*self.header).allocation_count }
    }

    /// Whether this instance created the segment (and unlinks it on drop)
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Check if the arena header carries the expected magic number
    pub fn is_initialized(&self) -> bool {
        unsafe { !self.header.is_null() && (*self.header).magic == super::MAGIC_NUMBER }
    }
}
