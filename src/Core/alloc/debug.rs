use super::*;
use std::fmt;

// Debug proxy implementation that calls the standalone debug function
impl fmt::Debug for ShmArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shm_arena(self, f)
    }
}
