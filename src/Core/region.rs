//! Unmanaged shared memory regions.
//!
//! A region is a named segment whose lifetime is managed by the application,
//! not by the message layer. Messages only ever point *into* a region; they
//! never allocate from it or free it. Chunks inside a region are identified by
//! their byte offset from the region base, which is the same in every process
//! even though each process maps the region at its own address.

use crate::error::{Result, ShmError};
use crate::Core::SharedMemory::SharedMemoryBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A mapped unmanaged region. Region id 0 is reserved for the default arena.
pub struct UnmanagedRegion {
    id: u32,
    shm: Box<dyn SharedMemoryBackend>,
    owner: bool,
}

impl UnmanagedRegion {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Base address of the region in this process.
    pub fn data(&self) -> *mut u8 {
        self.shm.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.shm.size()
    }

    /// Name of the backing segment.
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Whether `[ptr, ptr + len)` lies entirely inside this region.
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let base = self.shm.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= base + self.shm.size())
    }

    /// Whole region as a byte slice.
    ///
    /// # Safety
    /// Other processes may write the region concurrently; the caller must
    /// ensure no conflicting writes happen while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.shm.as_ptr(), self.shm.size())
    }

    /// Whole region as a mutable byte slice.
    ///
    /// # Safety
    /// The caller must ensure exclusive access to the bytes it touches.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.shm.as_ptr(), self.shm.size())
    }
}

impl std::fmt::Debug for UnmanagedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_unmanaged_region(self, f)
    }
}

impl Drop for UnmanagedRegion {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = crate::Core::SharedMemory::remove_shared_memory(self.shm.name()) {
                tracing::warn!(region_id = self.id, error = %e, "failed to unlink region segment");
            }
        }
    }
}

/// Lookup of unmanaged regions by id, as needed by the address resolver.
pub trait RegionRegistry: Send + Sync {
    /// Map (on first use) and return the region registered under `region_id`.
    fn get_region(&self, region_id: u32) -> Result<Arc<UnmanagedRegion>>;
}

/// Registry backed by named segments `<prefix>_<id>` under /dev/shm.
///
/// Regions created here are unlinked when their last handle drops; regions
/// created by another process are attached lazily and cached.
pub struct ShmRegionRegistry {
    prefix: String,
    regions: Mutex<HashMap<u32, Arc<UnmanagedRegion>>>,
    next_id: AtomicU32,
}

impl ShmRegionRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            regions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn segment_name(&self, region_id: u32) -> String {
        format!("{}_{}", self.prefix, region_id)
    }

    /// Create a region under the next free id.
    pub fn create_region(&self, size: usize) -> Result<Arc<UnmanagedRegion>> {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                return Err(ShmError::Segment("region ids exhausted".into()));
            }
            if !self.regions.lock().contains_key(&id) {
                return self.create_region_with_id(id, size);
            }
        }
    }

    /// Create a region under an id agreed on out of band with the peers.
    pub fn create_region_with_id(
        &self,
        region_id: u32,
        size: usize,
    ) -> Result<Arc<UnmanagedRegion>> {
        if region_id == 0 {
            return Err(ShmError::Segment(
                "region id 0 is reserved for the default arena".into(),
            ));
        }

        let mut regions = self.regions.lock();
        if regions.contains_key(&region_id) {
            return Err(ShmError::Segment(format!(
                "region {} already registered",
                region_id
            )));
        }

        let shm =
            crate::Core::SharedMemory::create_shared_memory(size, &self.segment_name(region_id))?;
        let region = Arc::new(UnmanagedRegion {
            id: region_id,
            shm,
            owner: true,
        });
        regions.insert(region_id, Arc::clone(&region));

        tracing::debug!(region_id, size, "created unmanaged region");
        Ok(region)
    }

    /// Drop the registry's handle on a region. The mapping stays alive for
    /// messages still holding it.
    pub fn remove_region(&self, region_id: u32) -> Option<Arc<UnmanagedRegion>> {
        self.regions.lock().remove(&region_id)
    }

    /// Number of regions currently mapped through this registry.
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

impl RegionRegistry for ShmRegionRegistry {
    fn get_region(&self, region_id: u32) -> Result<Arc<UnmanagedRegion>> {
        if region_id == 0 {
            return Err(ShmError::UnknownRegion(region_id));
        }

        let mut regions = self.regions.lock();
        if let Some(region) = regions.get(&region_id) {
            return Ok(Arc::clone(region));
        }

        // Created by a peer process: map it here once
        let shm = crate::Core::SharedMemory::attach_shared_memory(&self.segment_name(region_id))
            .map_err(|e| {
                tracing::error!(region_id, error = %e, "cannot map remote region");
                ShmError::UnknownRegion(region_id)
            })?;
        let region = Arc::new(UnmanagedRegion {
            id: region_id,
            shm,
            owner: false,
        });
        regions.insert(region_id, Arc::clone(&region));

        tracing::debug!(region_id, size = region.size(), "attached remote region");
        Ok(region)
    }
}
