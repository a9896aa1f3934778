// Module naming follows project convention (SHM = shared-memory message layer)
pub mod error;
pub mod ffi;

#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{
        attach_shared_memory, create_shared_memory, remove_shared_memory, RawHandle,
        SharedMemoryBackend,
    };
    pub mod alloc;
    pub use alloc::{ArenaManager, ShmArena};
    pub mod futex;
    pub mod region;
    pub use region::{RegionRegistry, ShmRegionRegistry, UnmanagedRegion};
    pub mod shutdown;
    pub use shutdown::ShutdownSignal;
}

#[allow(non_snake_case)]
pub mod SHM {
    pub mod chunk;
    pub mod context;
    pub mod message;
    pub mod resolver;
    pub mod Structs {
        pub mod Envelope_Structs;
        pub use Envelope_Structs::{Envelope, ENVELOPE_SIZE}; // re-export for stable path
    }
    pub use chunk::{ChunkAllocator, ChunkId, Ownership, ShmChunk};
    pub use context::{ContextBuilder, TransportContext};
    pub use message::Message;
    pub use resolver::{AddressResolver, ResolvedAddress};
}

#[allow(non_snake_case)]
mod Debug {
    pub mod StructDebug;
}

pub use error::{Result, ShmError};
