//! # Commit log interface
//!
//! The commit log itself is an external collaborator; the storage engine only
//! consumes an append-and-discard contract and orders its flush pipeline by
//! the replay positions the log hands back. A segmented in-memory
//! implementation ships so the contract can be exercised without a real log.

use crate::consts::COMMITLOG_SEGMENT_SIZE;
use crate::err::Error;
use crate::mutation::FrozenMutation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Monotonic identifier of a commit-log append: segment, then offset within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplayPosition {
    pub segment_id: u64,
    pub offset: u32,
}

impl ReplayPosition {
    /// The "no position" sentinel used by writes outside the commit-log
    /// ordering contract, e.g. streaming ingest.
    pub const ZERO: ReplayPosition = ReplayPosition {
        segment_id: 0,
        offset: 0,
    };

    pub fn new(segment_id: u64, offset: u32) -> Self {
        Self { segment_id, offset }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Callback invoked when the log wants a column family flushed so its
/// segments can be reclaimed.
pub type FlushHandler = Box<dyn Fn(Uuid, ReplayPosition) + Send + Sync>;

/// The append-and-discard contract consumed by the engine.
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Appends a frozen mutation for `cf_id`, returning its replay position.
    async fn add_entry(&self, cf_id: Uuid, mutation: &FrozenMutation)
        -> Result<ReplayPosition, Error>;

    /// Tells the log that everything for `cf_id` up to and including `rp`
    /// is durable in sstables and may be reclaimed.
    async fn discard_completed_segments(&self, cf_id: Uuid, rp: ReplayPosition);

    /// Registers a callback the log fires when it is running out of segments.
    fn add_flush_handler(&self, handler: FlushHandler);

    async fn shutdown(&self);
}

struct MemoryCommitLogState {
    segment_id: u64,
    offset: u32,
    discards: HashMap<Uuid, Vec<ReplayPosition>>,
    shut_down: bool,
}

/// Segmented in-memory commit log. Appends advance an offset and roll to a
/// new segment at capacity; discards are recorded per column family so tests
/// can assert on their order.
pub struct MemoryCommitLog {
    segment_size: usize,
    state: Mutex<MemoryCommitLogState>,
    handlers: Mutex<Vec<FlushHandler>>,
}

impl MemoryCommitLog {
    pub fn new() -> Self {
        Self::with_segment_size(COMMITLOG_SEGMENT_SIZE)
    }

    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            segment_size,
            state: Mutex::new(MemoryCommitLogState {
                segment_id: 1,
                offset: 0,
                discards: HashMap::new(),
                shut_down: false,
            }),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// The discard positions recorded for a column family, oldest first.
    pub fn discards(&self, cf_id: Uuid) -> Vec<ReplayPosition> {
        self.state
            .lock()
            .expect("commit log state poisoned")
            .discards
            .get(&cf_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryCommitLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommitLog for MemoryCommitLog {
    async fn add_entry(
        &self,
        cf_id: Uuid,
        mutation: &FrozenMutation,
    ) -> Result<ReplayPosition, Error> {
        let mut state = self.state.lock().expect("commit log state poisoned");
        if state.shut_down {
            return Err(Error::ShuttingDown);
        }
        let size = mutation.size() as u32;
        let mut sealed_segment = None;
        if state.offset as usize + size as usize > self.segment_size {
            sealed_segment = Some(ReplayPosition::new(state.segment_id, state.offset));
            state.segment_id += 1;
            state.offset = 0;
        }
        state.offset += size.max(1);
        let rp = ReplayPosition::new(state.segment_id, state.offset);
        drop(state);

        // A full segment wants reclaiming: ask for a flush up to its end.
        if let Some(flush_up_to) = sealed_segment {
            for handler in self
                .handlers
                .lock()
                .expect("commit log handlers poisoned")
                .iter()
            {
                handler(cf_id, flush_up_to);
            }
        }
        Ok(rp)
    }

    async fn discard_completed_segments(&self, cf_id: Uuid, rp: ReplayPosition) {
        log::debug!("commit log discard for {cf_id} up to {rp:?}");
        self.state
            .lock()
            .expect("commit log state poisoned")
            .discards
            .entry(cf_id)
            .or_default()
            .push(rp);
    }

    fn add_flush_handler(&self, handler: FlushHandler) {
        self.handlers
            .lock()
            .expect("commit log handlers poisoned")
            .push(handler);
    }

    async fn shutdown(&self) {
        self.state
            .lock()
            .expect("commit log state poisoned")
            .shut_down = true;
    }
}
