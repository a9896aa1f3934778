//! Error types for the shared-memory message layer.

use thiserror::Error;

/// Result type alias using the crate's [`ShmError`].
pub type Result<T> = std::result::Result<T, ShmError>;

/// Main error type for arena, region and message operations.
#[derive(Error, Debug)]
pub enum ShmError {
    /// The arena has no free block large enough right now. Transient: the
    /// chunk allocator polls until another process frees memory.
    #[error("shared memory arena exhausted: no block for {requested} bytes")]
    Exhausted { requested: usize },

    /// The request exceeds what the arena could hold even when empty.
    #[error("request of {requested} bytes exceeds arena capacity of {capacity} bytes")]
    TooLarge { requested: usize, capacity: usize },

    /// An allocation was abandoned because shutdown was signalled.
    #[error("allocation aborted: shutdown signalled")]
    Aborted,

    /// Envelope bytes of the wrong length (protocol corruption).
    #[error("malformed envelope: expected {expected} bytes, got {actual}")]
    InvalidEnvelope { expected: usize, actual: usize },

    /// No unmanaged region is registered or mappable under this id.
    #[error("unknown unmanaged region {0}")]
    UnknownRegion(u32),

    /// The arena could not translate this handle (peers disagree on shared state).
    #[error("invalid arena handle {0}")]
    InvalidHandle(isize),

    /// A chunk does not fit inside the region (or, for region 0, the arena
    /// allocation) it claims to live in.
    #[error("chunk [{offset}, +{len}) outside region {region_id} of {region_size} bytes")]
    OutOfRegion {
        region_id: u32,
        offset: usize,
        len: usize,
        region_size: usize,
    },

    /// The message holds no chunk.
    #[error("message not initialized")]
    NotInitialized,

    /// `copy_from` target already holds a chunk.
    #[error("copy target already initialized")]
    TargetInitialized,

    /// `copy_from` source holds no chunk.
    #[error("copy source not initialized")]
    SourceUninitialized,

    /// Segment layout or configuration problem.
    #[error("invalid shared memory segment: {0}")]
    Segment(String),

    /// I/O error from the shared memory backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Installing the Ctrl-C shutdown hook failed.
    #[error("signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
}
