// src/SHM/message.rs

use super::chunk::{AllocatedChunk, ChunkId, Ownership, ShmChunk};
use super::context::TransportContext;
use super::resolver::ResolvedAddress;
use super::Structs::Envelope_Structs::{Envelope, ENVELOPE_SIZE};
use crate::error::{Result, ShmError};
use crate::Core::region::UnmanagedRegion;
use std::ptr::NonNull;
use std::sync::Arc;

/// State of the envelope carried alongside the payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Meta {
    /// Closed: no envelope resources held.
    Absent,
    /// Empty carrier waiting to be filled (e.g. by a receive).
    Placeholder,
    /// Describes the chunk this message holds.
    Filled(Envelope),
}

/// A message whose payload lives in shared memory.
///
/// Only the fixed-size [`Envelope`] travels over the socket; a receiver in
/// another process resolves it back to the same bytes without copying.
///
/// A message holds at most one chunk. Closing (explicitly, on rebuild, or on
/// drop) frees the chunk only if it is an owned default-arena chunk that has
/// not been handed to the transport.
///
/// `Message` is `Send` but not `Sync`: its resolution cache is unsynchronized.
pub struct Message {
    ctx: TransportContext,
    meta: Meta,
    chunk: Option<ShmChunk>,
    resolved: ResolvedAddress,
}

// The cached pointer refers to shared memory kept alive by the context or the
// cached region handle, both of which are Send.
unsafe impl Send for Message {}

impl Message {
    fn blank(ctx: &TransportContext) -> Self {
        Self {
            ctx: ctx.clone(),
            meta: Meta::Absent,
            chunk: None,
            resolved: ResolvedAddress::new(),
        }
    }

    /// An empty message: no chunk, size 0. Used as a receive target.
    pub fn new(ctx: &TransportContext) -> Self {
        let mut msg = Self::blank(ctx);
        msg.meta = Meta::Placeholder;
        msg
    }

    /// A message owning a fresh arena chunk of exactly `size` bytes.
    ///
    /// Blocks while the arena is full; `Err(ShmError::Aborted)` on shutdown.
    pub fn with_size(ctx: &TransportContext, size: usize) -> Result<Self> {
        let mut msg = Self::blank(ctx);
        msg.initialize_chunk(size)?;
        Ok(msg)
    }

    /// Copy a process-local buffer into a fresh arena chunk, then hand the
    /// buffer to `release`.
    ///
    /// `release` runs exactly once, also when the allocation is aborted.
    pub fn from_external<B, F>(ctx: &TransportContext, buffer: B, release: F) -> Result<Self>
    where
        B: AsRef<[u8]>,
        F: FnOnce(B),
    {
        let mut msg = Self::blank(ctx);
        msg.adopt(buffer, release)?;
        Ok(msg)
    }

    /// [`Message::from_external`] with the default release (drop).
    pub fn from_vec(ctx: &TransportContext, buffer: Vec<u8>) -> Result<Self> {
        Self::from_external(ctx, buffer, drop)
    }

    /// Reference `size` bytes at `data` inside `region` without allocating.
    ///
    /// The region keeps ownership of the bytes; closing this message never
    /// frees them.
    pub fn from_region(
        ctx: &TransportContext,
        region: &Arc<UnmanagedRegion>,
        data: *const u8,
        size: usize,
    ) -> Result<Self> {
        if !region.contains(data, size) {
            return Err(ShmError::OutOfRegion {
                region_id: region.id(),
                offset: (data as usize).wrapping_sub(region.data() as usize),
                len: size,
                region_size: region.size(),
            });
        }

        let handle = (data as usize - region.data() as usize) as isize;
        let ptr = NonNull::new(data as *mut u8).ok_or(ShmError::NotInitialized)?;

        let mut msg = Self::blank(ctx);
        msg.install(
            ShmChunk {
                id: ChunkId::in_region(region.id(), handle),
                size,
                ownership: Ownership::Referenced,
            },
            ResolvedAddress::with_ptr(ptr, Some(Arc::clone(region))),
        );
        Ok(msg)
    }

    /// Reference `size` bytes at byte `offset` from the start of `region`.
    pub fn from_region_offset(
        ctx: &TransportContext,
        region: &Arc<UnmanagedRegion>,
        offset: usize,
        size: usize,
    ) -> Result<Self> {
        let data = region.data().wrapping_add(offset);
        Self::from_region(ctx, region, data, size)
    }

    /// Rebuild a message from envelope bytes received over the transport.
    ///
    /// A default-arena chunk becomes owned by the receiver (freed on close);
    /// a region chunk stays a reference.
    pub fn from_envelope(ctx: &TransportContext, bytes: &[u8]) -> Result<Self> {
        let mut msg = Self::new(ctx);
        msg.receive_envelope(bytes)?;
        Ok(msg)
    }

    /// Replace this message's contents with the chunk described by `bytes`.
    ///
    /// Malformed envelopes are logged and leave the message untouched.
    pub fn receive_envelope(&mut self, bytes: &[u8]) -> Result<()> {
        let envelope = Envelope::decode(bytes).map_err(|e| {
            tracing::error!(error = %e, "rejecting received envelope");
            e
        })?;

        if envelope.region_id == 0 && envelope.handle == 0 && !envelope.is_unset() {
            tracing::error!(size = envelope.payload_size, "envelope has a size but no handle");
            return Err(ShmError::InvalidHandle(0));
        }

        self.close();
        if envelope.is_unset() {
            self.meta = Meta::Placeholder;
            return Ok(());
        }

        let ownership = if envelope.region_id == 0 {
            Ownership::Owned
        } else {
            Ownership::Referenced
        };
        self.install(
            ShmChunk {
                id: ChunkId::in_region(envelope.region_id, envelope.handle),
                size: envelope.payload_size as usize,
                ownership,
            },
            ResolvedAddress::new(),
        );
        Ok(())
    }

    /// Close and turn into an empty message.
    pub fn rebuild(&mut self) {
        self.close();
        self.meta = Meta::Placeholder;
    }

    /// Close and reinitialize with a fresh chunk of `size` bytes.
    ///
    /// On `Err` the message is left closed and uninitialized.
    pub fn rebuild_with_size(&mut self, size: usize) -> Result<()> {
        self.close();
        self.initialize_chunk(size)
    }

    /// Close and reinitialize from an external buffer, see [`Message::from_external`].
    pub fn rebuild_from_external<B, F>(&mut self, buffer: B, release: F) -> Result<()>
    where
        B: AsRef<[u8]>,
        F: FnOnce(B),
    {
        self.close();
        self.adopt(buffer, release)
    }

    /// Deep-copy `other`'s payload into a fresh default-arena chunk.
    ///
    /// Rejected (logged, no change) if this message already holds a chunk or
    /// `other` holds none. The copy always lands in the default arena, even
    /// when `other` references a region.
    pub fn copy_from(&mut self, other: &Message) -> Result<()> {
        if self.chunk.is_some() {
            tracing::error!("Message::copy_from() fail: target message already initialized");
            return Err(ShmError::TargetInitialized);
        }
        if other.chunk.is_none() {
            tracing::error!("Message::copy_from() fail: source message not initialized");
            return Err(ShmError::SourceUninitialized);
        }

        let source = other.as_slice()?;
        self.initialize_chunk(source.len())?;
        let target = self.as_mut_slice()?;
        target.copy_from_slice(source);
        Ok(())
    }

    /// Address of the payload in this process, resolved on first call.
    pub fn data(&self) -> Result<NonNull<u8>> {
        let chunk = self.chunk.as_ref().ok_or(ShmError::NotInitialized)?;
        self.resolved
            .get_or_resolve(self.ctx.resolver(), chunk.id, chunk.size)
    }

    /// Payload bytes; empty for a message without a chunk.
    pub fn as_slice(&self) -> Result<&[u8]> {
        match self.chunk {
            None => Ok(&[]),
            Some(chunk) => {
                let ptr = self.data()?;
                Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), chunk.size) })
            }
        }
    }

    /// Mutable payload bytes; empty for a message without a chunk.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match self.chunk {
            None => Ok(&mut []),
            Some(chunk) => {
                let ptr = self.data()?;
                Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), chunk.size) })
            }
        }
    }

    /// Payload length in bytes, 0 for an empty message.
    pub fn size(&self) -> usize {
        self.chunk.map_or(0, |chunk| chunk.size)
    }

    pub fn region_id(&self) -> u32 {
        self.chunk.map_or(0, |chunk| chunk.id.region_id)
    }

    pub fn handle(&self) -> isize {
        self.chunk.map_or(0, |chunk| chunk.id.handle)
    }

    pub fn chunk(&self) -> Option<&ShmChunk> {
        self.chunk.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.chunk.is_some()
    }

    /// True if closing this message would free its chunk.
    pub fn owns_chunk(&self) -> bool {
        self.chunk.map_or(false, |chunk| chunk.must_release())
    }

    pub fn is_transferred(&self) -> bool {
        self.chunk
            .map_or(false, |chunk| chunk.ownership == Ownership::Transferred)
    }

    /// Record that the transport now owns the chunk; close will not free it.
    ///
    /// Must be called before anything else can alias the chunk.
    pub fn mark_transferred(&mut self) {
        if let Some(chunk) = self.chunk.as_mut() {
            if chunk.ownership == Ownership::Owned {
                chunk.ownership = Ownership::Transferred;
            }
        }
    }

    /// The envelope describing the current chunk, if any.
    pub fn envelope(&self) -> Option<&Envelope> {
        match &self.meta {
            Meta::Filled(envelope) => Some(envelope),
            _ => None,
        }
    }

    /// Bytes the transport sends in place of the payload.
    pub fn envelope_bytes(&self) -> Option<[u8; ENVELOPE_SIZE]> {
        self.envelope().map(Envelope::encode)
    }

    pub(crate) fn meta(&self) -> Meta {
        self.meta
    }

    pub fn context(&self) -> &TransportContext {
        &self.ctx
    }

    /// Release the owned chunk (if any) and the envelope. Idempotent.
    pub fn close(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            if chunk.must_release() {
                if let Err(e) = self.ctx.allocator().release(&chunk) {
                    tracing::error!(
                        handle = chunk.id.handle,
                        error = %e,
                        "failed to release chunk"
                    );
                }
            }
        }
        self.resolved = ResolvedAddress::new();
        self.meta = Meta::Absent;
    }

    fn initialize_chunk(&mut self, size: usize) -> Result<()> {
        let AllocatedChunk { chunk, ptr } = self.ctx.allocator().allocate(size)?;
        self.install(chunk, ResolvedAddress::with_ptr(ptr, None));
        Ok(())
    }

    fn adopt<B, F>(&mut self, buffer: B, release: F) -> Result<()>
    where
        B: AsRef<[u8]>,
        F: FnOnce(B),
    {
        let result = self.initialize_chunk(buffer.as_ref().len());
        if result.is_ok() {
            if let Ok(target) = self.as_mut_slice() {
                target.copy_from_slice(buffer.as_ref());
            }
        }
        release(buffer);
        result
    }

    fn install(&mut self, chunk: ShmChunk, resolved: ResolvedAddress) {
        self.meta = Meta::Filled(Envelope::new(
            chunk.size as u64,
            chunk.id.handle,
            chunk.id.region_id,
        ));
        self.chunk = Some(chunk);
        self.resolved = resolved;
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_message(self, f)
    }
}
