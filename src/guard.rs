//! Single-flight guard shared by the refresh and custom-alert paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// At most one holder of a [`FlightGuard`] exists at a time.
#[derive(Clone, Debug, Default)]
pub(crate) struct SingleFlight {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    /// Claims the slot, or returns `None` while another holder is alive.
    pub(crate) fn try_begin(&self) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the slot when dropped, on every exit path including task abort.
#[derive(Debug)]
pub(crate) struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
