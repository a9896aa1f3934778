use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

lazy_static::lazy_static! {
    static ref PROCESS_SHUTDOWN: ShutdownSignal = ShutdownSignal::new();
}

/// Cooperative cancellation token for blocking chunk allocations.
///
/// Clones share one flag. Once triggered it stays triggered: every allocator
/// polling on this signal gives up within one poll interval.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A fresh, untriggered signal independent of the process-wide one.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide signal. Contexts use it unless given another.
    pub fn global() -> Self {
        PROCESS_SHUTDOWN.clone()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown signalled");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Trigger this signal on Ctrl+C.
    ///
    /// Only one handler can be installed per process.
    pub fn install_ctrlc_handler(&self) -> crate::Result<()> {
        let signal = self.clone();
        ctrlc::set_handler(move || {
            signal.trigger();
        })?;
        Ok(())
    }
}
