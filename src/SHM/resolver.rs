// Turns (region id, handle) into an address in this process

use super::chunk::ChunkId;
use crate::error::{Result, ShmError};
use crate::Core::alloc::ArenaManager;
use crate::Core::region::{RegionRegistry, UnmanagedRegion};
use std::cell::{Cell, OnceCell};
use std::ptr::NonNull;
use std::sync::Arc;

/// Resolves chunk identities against the default arena or a registered region.
#[derive(Clone)]
pub struct AddressResolver {
    arena: Arc<dyn ArenaManager>,
    regions: Arc<dyn RegionRegistry>,
}

impl AddressResolver {
    pub fn new(arena: Arc<dyn ArenaManager>, regions: Arc<dyn RegionRegistry>) -> Self {
        Self { arena, regions }
    }

    /// Address of `len` bytes at a default-arena handle, checked against the
    /// live allocation behind it.
    pub fn resolve_arena(&self, handle: isize, len: usize) -> Result<NonNull<u8>> {
        let capacity = self.arena.payload_capacity(handle)?;
        if len > capacity {
            return Err(ShmError::OutOfRegion {
                region_id: 0,
                offset: handle.max(0) as usize,
                len,
                region_size: capacity,
            });
        }
        self.arena.address_from_handle(handle)
    }

    /// Look up (mapping on first use) an unmanaged region.
    pub fn region(&self, region_id: u32) -> Result<Arc<UnmanagedRegion>> {
        self.regions.get_region(region_id)
    }

    /// Address of `len` bytes at `handle` inside `region`, bounds-checked.
    pub fn resolve_in_region(
        region: &UnmanagedRegion,
        handle: isize,
        len: usize,
    ) -> Result<NonNull<u8>> {
        let out_of_region = || ShmError::OutOfRegion {
            region_id: region.id(),
            offset: handle.max(0) as usize,
            len,
            region_size: region.size(),
        };

        let offset = usize::try_from(handle).map_err(|_| out_of_region())?;
        match offset.checked_add(len) {
            Some(end) if end <= region.size() => {}
            _ => return Err(out_of_region()),
        }

        NonNull::new(unsafe { region.data().add(offset) }).ok_or_else(out_of_region)
    }
}

/// Per-message resolution cache.
///
/// Holds the resolved address for the message's current chunk and, for region
/// chunks, the region mapping that keeps that address valid. Not thread-safe:
/// a message is used from one thread at a time.
#[derive(Default)]
pub struct ResolvedAddress {
    ptr: Cell<Option<NonNull<u8>>>,
    region: OnceCell<Arc<UnmanagedRegion>>,
}

impl ResolvedAddress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with an address already known (freshly allocated or referenced chunk).
    pub fn with_ptr(ptr: NonNull<u8>, region: Option<Arc<UnmanagedRegion>>) -> Self {
        let resolved = Self {
            ptr: Cell::new(Some(ptr)),
            region: OnceCell::new(),
        };
        if let Some(region) = region {
            let _ = resolved.region.set(region);
        }
        resolved
    }

    pub fn cached(&self) -> Option<NonNull<u8>> {
        self.ptr.get()
    }

    /// Return the cached address, resolving it on the first call.
    pub fn get_or_resolve(
        &self,
        resolver: &AddressResolver,
        id: ChunkId,
        len: usize,
    ) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.ptr.get() {
            return Ok(ptr);
        }

        let ptr = if id.is_arena() {
            resolver.resolve_arena(id.handle, len)?
        } else {
            let region = match self.region.get() {
                Some(region) => region,
                None => {
                    let region = resolver.region(id.region_id)?;
                    self.region.get_or_init(|| region)
                }
            };
            AddressResolver::resolve_in_region(region, id.handle, len)?
        };

        self.ptr.set(Some(ptr));
        Ok(ptr)
    }
}
