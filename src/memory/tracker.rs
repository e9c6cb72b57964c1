//! # Leak Tracker
//!
//! Ownership registry of tracked direct memory blocks.
//!
//! Every tracked allocation is registered under its block identity and is
//! removed by the matching free. Owning handles that are dropped while
//! their block is still registered push the identity onto the unreachable
//! queue; the next leak check drains the queue and reports each identity
//! still present in the registry exactly once.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use super::allocator::Intention;
use super::backend::Address;

/// Release sites kept for double-free diagnostics
const RELEASE_HISTORY_LIMIT: usize = 65_536;

/// Identity of a block: equal iff same address and same size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub(crate) address: Address,
    pub(crate) size: usize,
}

impl BlockId {
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Call site captured when a block was allocated or released
pub struct AllocationSite {
    location: &'static Location<'static>,
    thread: Option<String>,
    timestamp: DateTime<Utc>,
    backtrace: Backtrace,
}

impl AllocationSite {
    /// Capture the caller's location and a full stack trace
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            thread: std::thread::current().name().map(str::to_string),
            timestamp: Utc::now(),
            backtrace: Backtrace::force_capture(),
        }
    }

    /// Source location of the outermost tracked caller
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Debug for AllocationSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationSite")
            .field("location", &self.location)
            .field("thread", &self.thread)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl fmt::Display for AllocationSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on thread '{}' at {}\n{}",
            self.location,
            self.thread.as_deref().unwrap_or("<unnamed>"),
            self.timestamp.to_rfc3339(),
            self.backtrace
        )
    }
}

/// Tracking metadata of a live tracked block
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub id: BlockId,
    pub intention: Intention,
    pub site: Arc<AllocationSite>,
}

/// Free of a block the registry does not know
#[derive(Debug)]
pub struct UnregisteredBlock {
    pub id: BlockId,
    pub last_release: Option<Arc<AllocationSite>>,
}

struct TrackerState {
    records: HashMap<BlockId, AllocationRecord>,
    releases: HashMap<BlockId, Arc<AllocationSite>>,
    leaked: u64,
}

/// Registry of tracked blocks plus the queue of dropped handles
pub struct LeakTracker {
    state: Mutex<TrackerState>,
    unreachable: SegQueue<BlockId>,
}

impl LeakTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                records: HashMap::new(),
                releases: HashMap::new(),
                leaked: 0,
            }),
            unreachable: SegQueue::new(),
        }
    }

    /// Register a freshly allocated block
    pub fn register(&self, record: AllocationRecord) {
        let mut state = self.state.lock();
        state.releases.remove(&record.id);
        if let Some(previous) = state.records.insert(record.id, record) {
            log::error!(
                "DIRECT-TRACK: block {:?} registered twice, previous allocation from {}",
                previous.id,
                previous.site.location()
            );
        }
    }

    /// Remove a block on explicit free
    pub fn unregister(
        &self,
        id: BlockId,
        release: Arc<AllocationSite>,
    ) -> Result<AllocationRecord, UnregisteredBlock> {
        let mut state = self.state.lock();
        match state.records.remove(&id) {
            Some(record) => {
                if state.releases.len() >= RELEASE_HISTORY_LIMIT {
                    log::debug!("DIRECT-TRACK: release history trimmed");
                    state.releases.clear();
                }
                state.releases.insert(id, release);
                Ok(record)
            }
            None => Err(UnregisteredBlock {
                id,
                last_release: state.releases.get(&id).cloned(),
            }),
        }
    }

    /// Queue the identity of a handle dropped without free
    pub fn mark_unreachable(&self, id: BlockId) {
        self.unreachable.push(id);
    }

    /// Drain the unreachable queue and return every never-freed block
    pub fn drain_leaks(&self) -> Vec<AllocationRecord> {
        let mut state = self.state.lock();
        let mut leaks = Vec::new();

        while let Some(id) = self.unreachable.pop() {
            if let Some(record) = state.records.remove(&id) {
                leaks.push(record);
            }
        }

        state.leaked += leaks.len() as u64;
        leaks
    }

    /// Snapshot of still-registered blocks
    pub fn outstanding(&self) -> Vec<AllocationRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    pub fn outstanding_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Total leaks confirmed so far
    pub fn leaked_count(&self) -> u64 {
        self.state.lock().leaked
    }
}

impl Default for LeakTracker {
    fn default() -> Self {
        Self::new()
    }
}
