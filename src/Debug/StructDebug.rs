use std::fmt;
use crate::Core::alloc::ShmArena;
use crate::Core::region::UnmanagedRegion;
use crate::SHM::message::{Message, Meta};

/// Debug function for ShmArena
///
/// Provides a safe debug representation that shows:
/// - Segment name and header location
/// - Capacity and live usage
/// - Initialization status
pub fn debug_shm_arena(arena: &ShmArena, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShmArena")
        .field("name", &arena.name())
        .field("header", &format_args!("{:p}", arena.header_ptr()))
        .field("capacity", &arena.capacity())
        .field("used_bytes", &arena.used_bytes())
        .field("allocations", &arena.allocation_count())
        .field("owner", &arena.is_owner())
        .field("initialized", &arena.is_initialized())
        .finish()
}

/// Debug function for UnmanagedRegion
///
/// Shows the base address without dereferencing the mapping
pub fn debug_unmanaged_region(region: &UnmanagedRegion, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UnmanagedRegion")
        .field("id", &region.id())
        .field("name", &region.name())
        .field("base", &format_args!("0x{:x}", region.data() as usize))
        .field("size", &region.size())
        .finish()
}

/// Debug function for Message
///
/// Shows chunk identity and ownership; never resolves or reads the payload
pub fn debug_message(msg: &Message, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let meta = match msg.meta() {
        Meta::Absent => "absent",
        Meta::Placeholder => "placeholder",
        Meta::Filled(_) => "filled",
    };
    f.debug_struct("Message")
        .field("size", &msg.size())
        .field("region_id", &msg.region_id())
        .field("handle", &msg.handle())
        .field("ownership", &msg.chunk().map(|chunk| chunk.ownership))
        .field("meta", &meta)
        .finish_non_exhaustive()
}
