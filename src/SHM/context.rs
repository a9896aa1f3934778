use super::chunk::{ChunkAllocator, DEFAULT_POLL_INTERVAL};
use super::resolver::AddressResolver;
use crate::error::Result;
use crate::Core::alloc::{ArenaManager, ShmArena};
use crate::Core::region::{RegionRegistry, ShmRegionRegistry};
use crate::Core::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;

/// Everything a message needs from its process: the arena, the region
/// registry, and the shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct TransportContext {
    allocator: ChunkAllocator,
    resolver: AddressResolver,
    shutdown: ShutdownSignal,
}

impl TransportContext {
    /// Assemble a context from explicit collaborators.
    pub fn new(
        arena: Arc<dyn ArenaManager>,
        regions: Arc<dyn RegionRegistry>,
        shutdown: ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            allocator: ChunkAllocator::new(Arc::clone(&arena), shutdown.clone(), poll_interval),
            resolver: AddressResolver::new(arena, regions),
            shutdown,
        }
    }

    pub fn allocator(&self) -> &ChunkAllocator {
        &self.allocator
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

pub struct ContextBuilder {
    segment_name: String,
    segment_size: usize,
    region_prefix: String,
    poll_interval: Duration,
    shutdown: Option<ShutdownSignal>,
    arena: Option<Arc<dyn ArenaManager>>,
    regions: Option<Arc<dyn RegionRegistry>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            segment_name: "dmxp_shmsg".to_string(),
            segment_size: 64 * 1024 * 1024, // 64MB default
            region_prefix: "dmxp_region".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown: None, // process-wide signal
            arena: None,
            regions: None,
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment_name(mut self, name: &str) -> Self {
        self.segment_name = name.to_string();
        self
    }

    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_region_prefix(mut self, prefix: &str) -> Self {
        self.region_prefix = prefix.to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Use a custom arena instead of a named segment.
    pub fn with_arena(mut self, arena: Arc<dyn ArenaManager>) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Use a custom region registry instead of `ShmRegionRegistry`.
    pub fn with_region_registry(mut self, regions: Arc<dyn RegionRegistry>) -> Self {
        self.regions = Some(regions);
        self
    }

    /// Build as the segment owner: creates (and later unlinks) the arena.
    pub fn create(self) -> Result<TransportContext> {
        let arena: Arc<dyn ArenaManager> = match self.arena {
            Some(ref arena) => Arc::clone(arena),
            None => Arc::new(ShmArena::create(&self.segment_name, self.segment_size)?),
        };
        Ok(self.finish(arena))
    }

    /// Build against an arena another process created.
    pub fn attach(self) -> Result<TransportContext> {
        let arena: Arc<dyn ArenaManager> = match self.arena {
            Some(ref arena) => Arc::clone(arena),
            None => Arc::new(ShmArena::attach(&self.segment_name)?),
        };
        Ok(self.finish(arena))
    }

    fn finish(self, arena: Arc<dyn ArenaManager>) -> TransportContext {
        let regions = self
            .regions
            .unwrap_or_else(|| Arc::new(ShmRegionRegistry::new(&self.region_prefix)));
        let shutdown = self.shutdown.unwrap_or_else(ShutdownSignal::global);

        tracing::debug!(
            segment = %self.segment_name,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "transport context ready"
        );
        TransportContext::new(arena, regions, shutdown, self.poll_interval)
    }
}
