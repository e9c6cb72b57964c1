//! # Leak Events
//!
//! Push side of leak reporting: events and the observers receiving them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::memory::{AllocationSite, Intention};

/// Leak of a tracked block, published once per detected leak
#[derive(Debug, Clone)]
pub struct LeakEvent {
    /// Monotonically increasing per factory, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    pub intention: Intention,
    pub site: Arc<AllocationSite>,
}

impl fmt::Display for LeakEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "leak #{} at {}: {} bytes ({:?}) allocated from {}",
            self.sequence,
            self.timestamp.to_rfc3339(),
            self.size,
            self.intention,
            self.site.location()
        )
    }
}

/// Receiver of leak events
///
/// Delivery is best-effort and at-most-once; observers must not block.
pub trait LeakObserver: Send + Sync {
    fn on_leak(&self, event: &LeakEvent);
}

impl<F> LeakObserver for F
where
    F: Fn(&LeakEvent) + Send + Sync,
{
    fn on_leak(&self, event: &LeakEvent) {
        self(event)
    }
}

/// Observer keeping every event it receives
#[derive(Default)]
pub struct LeakCollector {
    events: Mutex<Vec<LeakEvent>>,
}

impl LeakCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LeakEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Take all collected events
    pub fn drain(&self) -> Vec<LeakEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl LeakObserver for LeakCollector {
    fn on_leak(&self, event: &LeakEvent) {
        self.events.lock().push(event.clone());
    }
}
