//! The data model from spec §3: an immutable topic snapshot published
//! atomically, and the producer/consumer state hung off each partition
//! entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::BrokerErrorCode;

pub const NO_LEADER_EPOCH: i32 = -1;
pub const NOT_YET_CONSUMING: i64 = -1;
pub const UNREGISTERED: i32 = -1;

/// Producer queue for one partition (spec §3 "Record Buffer").
#[derive(Debug, Clone)]
pub struct RecordBuffer {
    pub last_acked_offset: i64,
    pub linger: std::time::Duration,
    /// -1 iff this buffer is not registered with a sink.
    pub sink_index: i32,
    pub batch_tries: u32,
    pub failing: bool,
}

impl RecordBuffer {
    pub fn new(linger: std::time::Duration) -> Self {
        Self {
            last_acked_offset: NOT_YET_CONSUMING,
            linger,
            sink_index: UNREGISTERED,
            batch_tries: 0,
            failing: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.sink_index != UNREGISTERED
    }

    pub fn clear_failing(&mut self) {
        self.failing = false;
    }

    /// Bumps the try count on the oldest in-flight batch; marks the buffer
    /// failing so readers know it is mid-retry.
    pub fn bump_tries_and_maybe_fail_batch_0(&mut self, _err: BrokerErrorCode) {
        self.batch_tries += 1;
        self.failing = true;
    }
}

/// Consumer offset state for one partition (spec §3 "Consumption Cursor").
#[derive(Debug, Clone)]
pub struct ConsumptionCursor {
    pub offset: i64,
    pub current_leader_epoch: i32,
    pub last_consumed_epoch: i32,
    /// -1 iff this cursor is not registered with a source.
    pub source_index: i32,
    pub failing: bool,
}

impl Default for ConsumptionCursor {
    fn default() -> Self {
        Self {
            offset: NOT_YET_CONSUMING,
            current_leader_epoch: NO_LEADER_EPOCH,
            last_consumed_epoch: NOT_YET_CONSUMING,
            source_index: UNREGISTERED,
            failing: false,
        }
    }
}

impl ConsumptionCursor {
    pub fn is_registered(&self) -> bool {
        self.source_index != UNREGISTERED
    }

    pub fn clear_failing(&mut self) {
        self.failing = false;
    }
}

/// Identifies the per-broker outbound pump (Sink) or inbound pump (Source)
/// a partition entry is associated with. Held by value (not a back
/// reference) so entries can be unregistered by index without a cycle —
/// see DESIGN.md's note on the cyclic-reference avoidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerId(pub i32);

/// One partition's state within a Topic State (spec §3 "Partition Entry").
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub id: i32,
    pub load_err: BrokerErrorCode,
    pub leader: BrokerId,
    pub leader_epoch: i32,
    pub buffer: RecordBuffer,
    pub cursor: ConsumptionCursor,
}

impl PartitionEntry {
    pub fn new(id: i32, leader: BrokerId, leader_epoch: i32, linger: std::time::Duration) -> Self {
        Self {
            id,
            load_err: BrokerErrorCode::NONE,
            leader,
            leader_epoch,
            buffer: RecordBuffer::new(linger),
            cursor: ConsumptionCursor::default(),
        }
    }
}

/// Per-topic state (spec §3 "Topic State").
#[derive(Debug, Clone, Default)]
pub struct TopicState {
    pub load_err: BrokerErrorCode,
    pub is_internal: bool,
    /// Ordered list of known partition IDs.
    pub partition_ids: Vec<i32>,
    /// Subset of `partition_ids` that is currently writable.
    pub writable_ids: Vec<i32>,
    pub all: HashMap<i32, PartitionEntry>,
    pub writable: HashMap<i32, PartitionEntry>,
}

impl TopicState {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The immutable, atomically-published value: topic name -> Topic State
/// (spec §3 "Topic Snapshot").
pub type TopicSnapshot = HashMap<String, TopicState>;

/// Lock-free-read, mutex-serialized-write holder for the topic snapshot
/// (spec §5 / §9 "Snapshot publication"). Readers clone the `Arc`; writers
/// take `write_mutex` to serialize concept-level writers (the per-topic
/// merge step and the "insert placeholder topics" step of refresh), then
/// install the new snapshot under the read-write lock.
///
/// Modeled on `health`'s `Arc<RwLock<HashMap<..>>>` component map,
/// generalized from "mutate the map" to "swap in a whole new immutable
/// map" so P1 (total order of published snapshots) holds.
pub struct SnapshotStore {
    current: RwLock<Arc<TopicSnapshot>>,
    write_mutex: Mutex<()>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(TopicSnapshot::new())),
            write_mutex: Mutex::new(()),
        }
    }

    /// Lock-free read of the current snapshot.
    pub fn load(&self) -> Arc<TopicSnapshot> {
        self.current
            .read()
            .expect("snapshot read lock poisoned")
            .clone()
    }

    /// Serializes writers against each other and installs `next` as the
    /// new snapshot in one atomic store.
    pub fn store(&self, next: Arc<TopicSnapshot>) {
        let _guard = self.write_mutex.lock().expect("snapshot write mutex poisoned");
        *self.current.write().expect("snapshot write lock poisoned") = next;
    }

    /// Runs `f` with exclusive writer access and the latest snapshot,
    /// publishing whatever it returns. Used by the "insert placeholder
    /// topics" step and the per-topic merge, both of which need
    /// read-modify-write atomicity across the whole map.
    pub fn update(&self, f: impl FnOnce(&TopicSnapshot) -> TopicSnapshot) {
        let _guard = self.write_mutex.lock().expect("snapshot write mutex poisoned");
        let current = self
            .current
            .read()
            .expect("snapshot read lock poisoned")
            .clone();
        let next = f(&current);
        *self.current.write().expect("snapshot write lock poisoned") = Arc::new(next);
    }
}
