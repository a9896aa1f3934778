// The envelope is the only thing that crosses the socket for shared-memory payloads

use crate::error::{Result, ShmError};

/// Size in bytes of an encoded envelope.
pub const ENVELOPE_SIZE: usize = 24;

// Wire size equals the in-memory record on 64-bit targets
#[cfg(target_pointer_width = "64")]
const _: () = assert!(std::mem::size_of::<Envelope>() == ENVELOPE_SIZE);

/// Describes where a payload lives: which region, at which handle, how long.
///
/// ABI-stable; all fields are little-endian on the wire. `region_id == 0`
/// means the default arena, `handle == 0` means "unset".
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub payload_size: u64,
    pub handle: isize,
    pub region_id: u32,
}

impl Envelope {
    pub fn new(payload_size: u64, handle: isize, region_id: u32) -> Self {
        Self {
            payload_size,
            handle,
            region_id,
        }
    }

    /// Serialize into exactly [`ENVELOPE_SIZE`] bytes. Padding is zeroed.
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        let mut out = [0u8; ENVELOPE_SIZE];
        out[0..8].copy_from_slice(&self.payload_size.to_le_bytes());
        out[8..16].copy_from_slice(&(self.handle as i64).to_le_bytes());
        out[16..20].copy_from_slice(&self.region_id.to_le_bytes());
        out
    }

    /// Inverse of [`Envelope::encode`]. Any other length is protocol corruption.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; ENVELOPE_SIZE] =
            bytes
                .try_into()
                .map_err(|_| ShmError::InvalidEnvelope {
                    expected: ENVELOPE_SIZE,
                    actual: bytes.len(),
                })?;

        let mut size = [0u8; 8];
        let mut handle = [0u8; 8];
        let mut region = [0u8; 4];
        size.copy_from_slice(&bytes[0..8]);
        handle.copy_from_slice(&bytes[8..16]);
        region.copy_from_slice(&bytes[16..20]);

        Ok(Self {
            payload_size: u64::from_le_bytes(size),
            handle: i64::from_le_bytes(handle) as isize,
            region_id: u32::from_le_bytes(region),
        })
    }

    /// An all-zero envelope describes no payload at all.
    pub fn is_unset(&self) -> bool {
        self.handle == 0 && self.region_id == 0 && self.payload_size == 0
    }
}
