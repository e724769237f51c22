//! Topic Snapshot Merge (C3): reconciles a freshly fetched `TopicMeta`
//! against the currently tracked `TopicState`, migrating producer buffers
//! and consumer cursors between brokers without losing records or
//! consumption position (spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::collaborators::{BrokerRegistry, MetadataFetcher, PartitionMeta, TopicMeta};
use crate::error::{BrokerErrorClass, BrokerErrorCode, MetadataError};
use crate::metadata_waiter::MetadataWaiter;
use crate::snapshot::{
    BrokerId, ConsumptionCursor, PartitionEntry, RecordBuffer, SnapshotStore, TopicSnapshot,
    TopicState,
};

/// Retriability classification for a broker error code. In the real
/// protocol this reads a generated table; here it is the small set this
/// crate's merge logic actually branches on.
fn classify(err: BrokerErrorCode) -> BrokerErrorClass {
    if err.is_none() {
        BrokerErrorClass::Retriable
    } else if err == BrokerErrorCode::COORDINATOR_NOT_AVAILABLE
        || err == BrokerErrorCode::COORDINATOR_LOAD_IN_PROGRESS
        || err == BrokerErrorCode::REBALANCE_IN_PROGRESS
    {
        BrokerErrorClass::Retriable
    } else {
        BrokerErrorClass::NonRetriable
    }
}

pub struct RefreshOutcome {
    pub needs_retry: bool,
}

/// Orchestrates one full `refresh()` pass (spec §4.3 steps 1-7): fetches
/// metadata for the tracked topic set, folds in any newly-discovered
/// topics under `all_topics` subscription, merges each topic, and signals
/// the waiter.
pub struct TopicsManager {
    snapshot: SnapshotStore,
    registry: Arc<dyn BrokerRegistry>,
    fetcher: Arc<dyn MetadataFetcher>,
    waiter: Arc<MetadataWaiter>,
    default_linger: Duration,
}

impl TopicsManager {
    pub fn new(
        registry: Arc<dyn BrokerRegistry>,
        fetcher: Arc<dyn MetadataFetcher>,
        waiter: Arc<MetadataWaiter>,
        default_linger: Duration,
    ) -> Self {
        Self {
            snapshot: SnapshotStore::new(),
            registry,
            fetcher,
            waiter,
            default_linger,
        }
    }

    pub fn snapshot(&self) -> Arc<TopicSnapshot> {
        self.snapshot.load()
    }

    /// Registers a topic with an empty state so it is tracked by future
    /// refreshes (used when a caller subscribes to a specific topic rather
    /// than a regex).
    pub fn track(&self, topic: &str) {
        self.snapshot.update(|snap| {
            let mut next = snap.clone();
            next.entry(topic.to_string()).or_insert_with(TopicState::empty);
            next
        });
    }

    pub async fn refresh(&self, all_topics: bool) -> Result<RefreshOutcome, MetadataError> {
        let current = self.snapshot.load();
        let tracked: Vec<String> = current.keys().cloned().collect();

        let fresh = self
            .fetcher
            .fetch_metadata(all_topics, &tracked)
            .await
            .map_err(MetadataError::Fetch)?;

        if all_topics {
            let new_topics: Vec<String> = fresh
                .topics
                .keys()
                .filter(|t| !current.contains_key(t.as_str()))
                .cloned()
                .collect();
            if !new_topics.is_empty() {
                self.snapshot.update(|snap| {
                    let mut next = snap.clone();
                    for topic in &new_topics {
                        next.entry(topic.clone()).or_insert_with(TopicState::empty);
                    }
                    next
                });
            }
        }

        let mut needs_retry = false;
        let mut changed_topics: Vec<String> = Vec::with_capacity(fresh.topics.len());
        for (topic, meta) in &fresh.topics {
            let retry = self.merge_and_install(topic, meta);
            needs_retry |= retry;
            changed_topics.push(topic.clone());
        }

        self.registry.on_metadata_changed(&changed_topics);
        self.waiter.signal_updated();
        Ok(RefreshOutcome { needs_retry })
    }

    fn merge_and_install(&self, topic: &str, fresh: &TopicMeta) -> bool {
        let mut retry = false;
        self.snapshot.update(|snap| {
            let mut next = snap.clone();
            let old = next.get(topic).cloned().unwrap_or_default();
            let (merged, needs_retry) =
                merge_topic(topic, &old, fresh, self.default_linger, self.registry.as_ref());
            retry = needs_retry;
            next.insert(topic.to_string(), merged);
            next
        });
        if retry {
            metrics::counter!("topic_merge_retry_total").increment(1);
        }
        retry
    }
}

/// The per-topic merge algorithm (spec §4.3 "Per-topic merge"). Pure in
/// the sense that it returns the next `TopicState` rather than mutating in
/// place, but it does perform the Sink/Source registration side effects
/// the spec calls external-collaborator territory, since those have no
/// observable effect on the returned value itself.
pub fn merge_topic(
    topic: &str,
    old: &TopicState,
    fresh: &TopicMeta,
    default_linger: Duration,
    registry: &dyn BrokerRegistry,
) -> (TopicState, bool) {
    let mut merged = old.clone();
    merged.load_err = fresh.load_err;
    merged.is_internal = fresh.is_internal;

    if !fresh.load_err.is_none() {
        return match classify(fresh.load_err) {
            BrokerErrorClass::Retriable => {
                for entry in merged.all.values_mut() {
                    entry.buffer.bump_tries_and_maybe_fail_batch_0(fresh.load_err);
                }
                (merged, true)
            }
            BrokerErrorClass::NonRetriable => {
                for (&partition, entry) in merged.all.iter() {
                    let sink = registry.sink(entry.leader);
                    sink.fail_all_records(topic, partition, entry.buffer.sink_index, fresh.load_err);
                }
                (merged, false)
            }
        };
    }

    let fresh_by_id: HashMap<i32, &PartitionMeta> =
        fresh.partitions.iter().map(|p| (p.id, p)).collect();
    merged.partition_ids = fresh.partitions.iter().map(|p| p.id).collect();
    merged.writable_ids = fresh
        .partitions
        .iter()
        .filter(|p| p.is_writable)
        .map(|p| p.id)
        .collect();

    let mut deleted: Vec<i32> = Vec::new();
    for &id in old.all.keys() {
        if !fresh_by_id.contains_key(&id) {
            deleted.push(id);
        }
    }

    let mut retry = false;
    let mut all = HashMap::new();

    for meta in &fresh.partitions {
        let prior = old.all.get(&meta.id);
        let entry = match prior {
            None => {
                // New partition: nothing to preserve or migrate.
                if meta.load_err.is_none() {
                    let mut entry = PartitionEntry::new(
                        meta.id,
                        meta.leader,
                        meta.leader_epoch,
                        default_linger,
                    );
                    register_new(topic, &mut entry, registry);
                    entry
                } else {
                    PartitionEntry::new(meta.id, meta.leader, meta.leader_epoch, default_linger)
                }
            }
            Some(prior) => {
                if !meta.load_err.is_none() {
                    // Preserve the prior entry's buffer/cursor; keep the
                    // fresh error. Leader/epoch fields are preserved from
                    // the old entry too (spec §9 open question, resolved
                    // in DESIGN.md).
                    let mut entry = prior.clone();
                    entry.load_err = meta.load_err;
                    entry.buffer.bump_tries_and_maybe_fail_batch_0(meta.load_err);
                    retry = true;
                    entry
                } else if meta.leader_epoch < prior.leader_epoch && prior.leader_epoch != crate::snapshot::NO_LEADER_EPOCH {
                    // Epoch must not go backwards (P3): skip this update,
                    // keep the prior entry untouched.
                    prior.clone()
                } else if meta.leader == prior.leader {
                    // Same broker: the buffer/cursor identity is preserved
                    // verbatim (P2).
                    let mut entry = prior.clone();
                    entry.leader_epoch = meta.leader_epoch;
                    entry.load_err = BrokerErrorCode::NONE;
                    entry.buffer.clear_failing();
                    entry.cursor.clear_failing();
                    entry
                } else {
                    let mut entry = PartitionEntry::new(
                        meta.id,
                        meta.leader,
                        meta.leader_epoch,
                        default_linger,
                    );
                    entry.buffer = prior.buffer.clone();
                    entry.cursor = prior.cursor.clone();
                    migrate(topic, &mut entry, prior, registry);
                    entry.buffer.clear_failing();
                    entry.cursor.clear_failing();
                    entry
                }
            }
        };
        all.insert(meta.id, entry);
    }

    merged.all = all.clone();
    merged.writable = all
        .into_iter()
        .filter(|(id, _)| merged.writable_ids.contains(id))
        .collect();

    for id in deleted {
        if let Some(entry) = old.all.get(&id) {
            let sink = registry.sink(entry.leader);
            sink.remove_production(topic, id, entry.buffer.sink_index);
            sink.fail_all_records(topic, id, entry.buffer.sink_index, BrokerErrorCode::PARTITION_DELETED);

            let source = registry.source(entry.leader);
            source.remove_consumption(topic, id, entry.cursor.source_index);
            source.clear_consumer_state(topic, id, entry.cursor.source_index);
            info!(topic, partition = id, "partition deleted from metadata");
            metrics::counter!("topic_merge_partitions_deleted_total").increment(1);
        }
    }

    (merged, retry)
}

fn register_new(topic: &str, entry: &mut PartitionEntry, registry: &dyn BrokerRegistry) {
    if !entry.buffer.is_registered() {
        let sink = registry.sink(entry.leader);
        entry.buffer.sink_index = sink.add_production(topic, entry.id);
    }
    if !entry.cursor.is_registered() {
        let source = registry.source(entry.leader);
        entry.cursor.source_index = source.add_consumption(topic, entry.id);
    }
}

fn migrate(
    topic: &str,
    entry: &mut PartitionEntry,
    prior: &PartitionEntry,
    registry: &dyn BrokerRegistry,
) {
    let from_sink = registry.sink(prior.leader);
    let to_sink = registry.sink(entry.leader);
    entry.buffer.sink_index =
        to_sink.migrate_production(topic, entry.id, from_sink.as_ref(), prior.buffer.sink_index);

    let from_source = registry.source(prior.leader);
    let to_source = registry.source(entry.leader);
    entry.cursor.source_index = to_source.migrate_consumption(
        topic,
        entry.id,
        from_source.as_ref(),
        prior.cursor.source_index,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BrokerRegistry, Sink, Source};
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBroker {
        registrations: Mutex<Vec<(String, i32)>>,
        failed: Mutex<Vec<(String, i32, BrokerErrorCode)>>,
    }

    impl Sink for FakeBroker {
        fn add_production(&self, topic: &str, partition: i32) -> i32 {
            let mut regs = self.registrations.lock().unwrap();
            regs.push((topic.to_string(), partition));
            regs.len() as i32 - 1
        }
        fn remove_production(&self, _topic: &str, _partition: i32, _index: i32) {}
        fn migrate_production(
            &self,
            topic: &str,
            partition: i32,
            _from: &dyn Sink,
            _from_index: i32,
        ) -> i32 {
            self.add_production(topic, partition)
        }
        fn fail_all_records(&self, topic: &str, partition: i32, _index: i32, err: BrokerErrorCode) {
            self.failed.lock().unwrap().push((topic.to_string(), partition, err));
        }
    }

    impl Source for FakeBroker {
        fn add_consumption(&self, topic: &str, partition: i32) -> i32 {
            let mut regs = self.registrations.lock().unwrap();
            regs.push((topic.to_string(), partition));
            regs.len() as i32 - 1
        }
        fn remove_consumption(&self, _topic: &str, _partition: i32, _index: i32) {}
        fn migrate_consumption(
            &self,
            topic: &str,
            partition: i32,
            _from: &dyn Source,
            _from_index: i32,
        ) -> i32 {
            self.add_consumption(topic, partition)
        }
        fn clear_consumer_state(&self, _topic: &str, _partition: i32, _index: i32) {}
    }

    struct FakeRegistry {
        brokers: Map<i32, Arc<FakeBroker>>,
        changed_calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRegistry {
        fn new(ids: &[i32]) -> Self {
            Self {
                brokers: ids.iter().map(|&id| (id, Arc::new(FakeBroker::default()))).collect(),
                changed_calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl BrokerRegistry for FakeRegistry {
        fn sink(&self, broker: BrokerId) -> Arc<dyn Sink> {
            self.brokers.get(&broker.0).expect("unknown broker").clone()
        }
        fn source(&self, broker: BrokerId) -> Arc<dyn Source> {
            self.brokers.get(&broker.0).expect("unknown broker").clone()
        }
        fn on_metadata_changed(&self, topics: &[String]) {
            self.changed_calls.lock().unwrap().push(topics.to_vec());
        }
    }

    struct FixedFetcher {
        response: MetadataResponse,
    }

    #[async_trait::async_trait]
    impl MetadataFetcher for FixedFetcher {
        async fn fetch_metadata(
            &self,
            _all_topics: bool,
            _topics: &[String],
        ) -> Result<MetadataResponse, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.response.clone())
        }
    }

    fn meta(id: i32, leader: i32, epoch: i32) -> PartitionMeta {
        PartitionMeta {
            id,
            leader: BrokerId(leader),
            leader_epoch: epoch,
            load_err: BrokerErrorCode::NONE,
            is_writable: true,
        }
    }

    #[test]
    fn same_leader_preserves_buffer_identity() {
        let registry = FakeRegistry::new(&[1]);
        let mut old = TopicState::empty();
        let mut entry = PartitionEntry::new(0, BrokerId(1), 5, Duration::from_millis(20));
        entry.buffer.last_acked_offset = 42;
        old.all.insert(0, entry);
        old.partition_ids = vec![0];

        let fresh = TopicMeta {
            load_err: BrokerErrorCode::NONE,
            is_internal: false,
            partitions: vec![meta(0, 1, 6)],
        };

        let (merged, retry) = merge_topic("t", &old, &fresh, Duration::from_millis(20), &registry);
        assert!(!retry);
        assert_eq!(merged.all[&0].buffer.last_acked_offset, 42);
        assert_eq!(merged.all[&0].leader_epoch, 6);
    }

    #[test]
    fn leader_change_migrates_and_preserves_records() {
        let registry = FakeRegistry::new(&[1, 2]);
        let mut old = TopicState::empty();
        let mut entry = PartitionEntry::new(0, BrokerId(1), 5, Duration::from_millis(20));
        entry.buffer.sink_index = 0;
        entry.buffer.last_acked_offset = 7;
        old.all.insert(0, entry);
        old.partition_ids = vec![0];

        let fresh = TopicMeta {
            load_err: BrokerErrorCode::NONE,
            is_internal: false,
            partitions: vec![meta(0, 2, 6)],
        };

        let (merged, _) = merge_topic("t", &old, &fresh, Duration::from_millis(20), &registry);
        assert_eq!(merged.all[&0].leader, BrokerId(2));
        assert_eq!(merged.all[&0].buffer.last_acked_offset, 7);
    }

    #[test]
    fn backwards_epoch_is_skipped() {
        let registry = FakeRegistry::new(&[1]);
        let mut old = TopicState::empty();
        let entry = PartitionEntry::new(0, BrokerId(1), 10, Duration::from_millis(20));
        old.all.insert(0, entry);
        old.partition_ids = vec![0];

        let fresh = TopicMeta {
            load_err: BrokerErrorCode::NONE,
            is_internal: false,
            partitions: vec![meta(0, 1, 3)],
        };

        let (merged, _) = merge_topic("t", &old, &fresh, Duration::from_millis(20), &registry);
        assert_eq!(merged.all[&0].leader_epoch, 10);
    }

    #[test]
    fn deleted_partition_fails_records_and_clears_cursor() {
        let registry = FakeRegistry::new(&[1]);
        let mut old = TopicState::empty();
        let entry = PartitionEntry::new(2, BrokerId(1), 1, Duration::from_millis(20));
        old.all.insert(2, entry);
        old.partition_ids = vec![0, 1, 2];

        let fresh = TopicMeta {
            load_err: BrokerErrorCode::NONE,
            is_internal: false,
            partitions: vec![meta(0, 1, 1), meta(1, 1, 1)],
        };

        let (merged, _) = merge_topic("t", &old, &fresh, Duration::from_millis(20), &registry);
        assert!(!merged.all.contains_key(&2));
        let broker = registry.brokers.get(&1).unwrap();
        let failed = broker.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].2, BrokerErrorCode::PARTITION_DELETED);
    }

    #[test]
    fn identical_metadata_is_a_no_op() {
        let registry = FakeRegistry::new(&[1]);
        let mut old = TopicState::empty();
        let mut entry = PartitionEntry::new(0, BrokerId(1), 5, Duration::from_millis(20));
        entry.buffer.last_acked_offset = 99;
        old.all.insert(0, entry);
        old.partition_ids = vec![0];

        let fresh = TopicMeta {
            load_err: BrokerErrorCode::NONE,
            is_internal: false,
            partitions: vec![meta(0, 1, 5)],
        };

        let (merged, retry) = merge_topic("t", &old, &fresh, Duration::from_millis(20), &registry);
        assert!(!retry);
        assert_eq!(merged.all[&0].leader_epoch, 5);
        assert_eq!(merged.all[&0].buffer.last_acked_offset, 99);
    }

    #[test]
    fn topic_level_retriable_error_bumps_tries_and_requests_retry() {
        let registry = FakeRegistry::new(&[1]);
        let mut old = TopicState::empty();
        old.all.insert(0, PartitionEntry::new(0, BrokerId(1), 1, Duration::from_millis(20)));

        let fresh = TopicMeta {
            load_err: BrokerErrorCode::COORDINATOR_LOAD_IN_PROGRESS,
            is_internal: false,
            partitions: vec![],
        };

        let (merged, retry) = merge_topic("t", &old, &fresh, Duration::from_millis(20), &registry);
        assert!(retry);
        assert_eq!(merged.all[&0].buffer.batch_tries, 1);
    }

    /// Spec §4.3 step 5: `refresh()` signals the consumer subsystem once
    /// per pass, naming every topic present in the fetched response.
    #[tokio::test]
    async fn refresh_signals_the_registry_with_the_fetched_topics() {
        let registry = Arc::new(FakeRegistry::new(&[1]));
        let (hard_tx, _hard_rx) = tokio::sync::mpsc::channel(1);
        let waiter = Arc::new(crate::metadata_waiter::MetadataWaiter::new(
            Duration::from_millis(100),
            hard_tx,
        ));
        let mut topics = HashMap::new();
        topics.insert(
            "orders".to_string(),
            TopicMeta {
                load_err: BrokerErrorCode::NONE,
                is_internal: false,
                partitions: vec![meta(0, 1, 1)],
            },
        );
        let fetcher = Arc::new(FixedFetcher {
            response: crate::collaborators::MetadataResponse { topics },
        });

        let manager = TopicsManager::new(registry.clone(), fetcher, waiter, Duration::from_millis(20));
        manager.track("orders");

        manager.refresh(false).await.unwrap();

        let calls = registry.changed_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["orders".to_string()]);
    }
}
