//! Trait seams for the external collaborators named in spec §6: the wire
//! codec, connection pool, record batcher, and consumer fetch path are out
//! of scope, but this core still needs an interface to drive them. A
//! concrete implementation atop `rdkafka` lives in `broker`.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BrokerErrorCode;
use crate::snapshot::BrokerId;

/// A partition's identity as reported in a `MetadataResponse`.
#[derive(Debug, Clone)]
pub struct PartitionMeta {
    pub id: i32,
    pub leader: BrokerId,
    /// -1 when the broker's metadata response predates leader epochs
    /// (protocol version < 7).
    pub leader_epoch: i32,
    pub load_err: BrokerErrorCode,
    pub is_writable: bool,
}

/// One topic's worth of metadata as reported by the broker.
#[derive(Debug, Clone, Default)]
pub struct TopicMeta {
    pub load_err: BrokerErrorCode,
    pub is_internal: bool,
    pub partitions: Vec<PartitionMeta>,
}

/// `MetadataResponse`, scoped to the topics this crate asked about.
#[derive(Debug, Clone, Default)]
pub struct MetadataResponse {
    pub topics: HashMap<String, TopicMeta>,
}

/// Outbound `Metadata` collaborator (spec §6).
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch_metadata(
        &self,
        all_topics: bool,
        topics: &[String],
    ) -> Result<MetadataResponse, Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-broker outbound batch pump (spec §3/§9 "Sink"). Owns the
/// registration of `RecordBuffer`s by index so partition entries hold only
/// an index, never a back-reference (spec §9 cyclic-reference note).
pub trait Sink: Send + Sync {
    /// Registers a buffer with this sink, returning its index.
    fn add_production(&self, topic: &str, partition: i32) -> i32;
    fn remove_production(&self, topic: &str, partition: i32, index: i32);
    /// Moves a partition's buffered records from `from` to this sink,
    /// preserving them, and returns the new registration index.
    fn migrate_production(
        &self,
        topic: &str,
        partition: i32,
        from: &dyn Sink,
        from_index: i32,
    ) -> i32;
    /// Completes every buffered record's delivery promise with `err`.
    fn fail_all_records(&self, topic: &str, partition: i32, index: i32, err: BrokerErrorCode);
}

/// Per-broker fetch pump (spec §3/§9 "Source"). Owns `ConsumptionCursor`
/// registrations the same way `Sink` owns buffer registrations.
pub trait Source: Send + Sync {
    fn add_consumption(&self, topic: &str, partition: i32) -> i32;
    fn remove_consumption(&self, topic: &str, partition: i32, index: i32);
    /// Moves a partition's cursor position from `from` to this source,
    /// preserving consumption progress, and returns the new index.
    fn migrate_consumption(
        &self,
        topic: &str,
        partition: i32,
        from: &dyn Source,
        from_index: i32,
    ) -> i32;
    /// Drops all per-partition consumer state (in-flight fetches, pause
    /// state) after a partition deletion.
    fn clear_consumer_state(&self, topic: &str, partition: i32, index: i32);
}

/// Resolves the `Sink`/`Source` for a given broker, so the merge logic can
/// look up "the new leader's sink" without owning broker connections
/// itself.
pub trait BrokerRegistry: Send + Sync {
    fn sink(&self, broker: BrokerId) -> std::sync::Arc<dyn Sink>;
    fn source(&self, broker: BrokerId) -> std::sync::Arc<dyn Source>;

    /// Notifies the consumer subsystem that topic/partition metadata
    /// changed (spec §4.3 step 5), so regex subscriptions can be
    /// re-evaluated against the now-current topic list. Called once per
    /// `refresh()`, after the new snapshot is published.
    fn on_metadata_changed(&self, topics: &[String]);
}

/// The transactional/flushable producer collaborator (spec §6 "Producer").
#[async_trait]
pub trait TxnProducer: Send + Sync {
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn abort_buffered_records(
        &self,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-partition committed/uncommitted offset pair used by the
/// transactional offset commit path (spec §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetAndEpoch {
    pub offset: i64,
    pub leader_epoch: i32,
}

pub type OffsetMap = HashMap<(String, i32), OffsetAndEpoch>;

/// Response to a `TxnOffsetCommit` (spec §6 "Inbound from broker").
#[derive(Debug, Clone, Default)]
pub struct TxnOffsetCommitResponse {
    pub version: i16,
    /// Per-partition error code; `BrokerErrorCode::NONE` on success.
    pub partition_errors: HashMap<(String, i32), BrokerErrorCode>,
}

impl TxnOffsetCommitResponse {
    pub fn is_kip447(&self) -> bool {
        self.version >= 3
    }
}

/// Response to an `EndTxn` (spec §6 "Inbound from broker").
#[derive(Debug, Clone, Copy)]
pub struct EndTxnResponse {
    pub error: BrokerErrorCode,
}

impl EndTxnResponse {
    pub fn is_operation_not_attempted(&self) -> bool {
        self.error == BrokerErrorCode::OPERATION_NOT_ATTEMPTED
    }
}

/// The group-consumer collaborator (spec §6 "Group Consumer"): supplies
/// offsets, a heartbeat-force channel, and the `AddOffsetsToTxn`/
/// `TxnOffsetCommit`/`EndTxn` RPCs this crate drives.
#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Offsets this consumer has already committed (used as the set-offsets
    /// fallback on a failed/aborted End).
    async fn committed_offsets(&self) -> OffsetMap;
    /// Offsets the consumer has processed but not yet committed (the
    /// optimistic "postcommit" set installed after a successful commit).
    async fn uncommitted_offsets(&self) -> OffsetMap;
    /// Overwrites the client's view of consumed offsets.
    async fn set_offsets(&self, offsets: OffsetMap);

    /// Forces an immediate heartbeat and awaits its ack.
    async fn force_heartbeat(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    async fn add_offsets_to_txn(
        &self,
        group_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    async fn txn_offset_commit(
        &self,
        group_id: &str,
        offsets: &OffsetMap,
    ) -> Result<TxnOffsetCommitResponse, Box<dyn std::error::Error + Send + Sync>>;

    async fn end_txn(
        &self,
        commit: bool,
    ) -> Result<EndTxnResponse, Box<dyn std::error::Error + Send + Sync>>;
}
