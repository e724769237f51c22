use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_topic_metadata_refresh_interval_ms: Option<u32>,
    pub kafka_producer_batch_size: Option<u32>, // Batch size in bytes (e.g., 8388608 for 8 MB)
    pub kafka_enable_idempotence: Option<bool>, // Enable idempotent producer for exactly-once semantics
    pub kafka_max_in_flight: Option<u32>,       // Max in-flight requests per connection
    pub kafka_retry_backoff_ms: Option<u32>,    // Backoff time between retry attempts
    pub kafka_socket_timeout_ms: Option<u32>,   // Socket operation timeout
    pub kafka_metadata_max_age_ms: Option<u32>, // Metadata refresh interval
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Note: consumers used in a transactional fashion should disable auto offset commits,
    // as their offsets should be committed via the transactional producer. All consumers
    // disable auto offset /storing/.
    pub kafka_consumer_auto_commit: bool,

    // expose override config for interval (in milliseconds) between
    // Kafka offset commit attempts
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: i32,
}

/// Knobs for the metadata refresh loop (C2) and waiter (C1).
#[derive(Envconfig, Clone)]
pub struct MetadataConfig {
    // Max period between refreshes; also the ticker interval in C2.
    #[envconfig(default = "250000")]
    pub kafka_metadata_max_age_ms: u64,

    // Floor between refreshes unless a hard trigger arrives.
    #[envconfig(default = "5000")]
    pub kafka_metadata_min_age_ms: u64,

    // Coalescing pause after a hard trigger, to damp thundering herds.
    #[envconfig(default = "50")]
    pub kafka_hard_trigger_coalesce_ms: u64,

    // Cap on hard-trigger retry attempts within one refresh cycle.
    #[envconfig(default = "10")]
    pub kafka_hard_trigger_max_attempts: u32,

    // Freshness threshold used by the waiter (C1): an update less than this
    // old satisfies `wait` immediately.
    #[envconfig(default = "1000")]
    pub kafka_metadata_freshness_ms: u64,
}

impl MetadataConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_max_age_ms)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_min_age_ms)
    }

    pub fn hard_trigger_coalesce(&self) -> Duration {
        Duration::from_millis(self.kafka_hard_trigger_coalesce_ms)
    }

    pub fn freshness_threshold(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_freshness_ms)
    }

    /// Exponential backoff with a 30s ceiling, keyed by consecutive error count.
    pub fn retry_backoff(&self, consecutive_errors: u32) -> Duration {
        let capped = consecutive_errors.min(6);
        let ms = 250u64.saturating_mul(1u64 << capped);
        Duration::from_millis(ms.min(30_000))
    }
}

/// Knobs for the transactional session (C4) and the concurrent-txn retry
/// envelope (C6).
#[derive(Envconfig, Clone)]
pub struct TransactionConfig {
    // Enables transactional mode; absence causes Begin/commit to fail with
    // `not_transactional`.
    pub kafka_txn_id: Option<String>,

    // Producer-ID protocol version; gates recovery classification (§4.5).
    #[envconfig(default = "4")]
    pub kafka_id_version: u32,

    // Whether revoke with an empty partition map is a no-op (cooperative
    // incremental rebalancing).
    #[envconfig(default = "true")]
    pub kafka_cooperative: bool,

    // If true and KIP-447 (TxnOffsetCommit version >= 3) is observed, skip
    // the 200ms post-commit sleep before releasing the session mutex.
    #[envconfig(default = "false")]
    pub kafka_require_stable_fetch_offsets: bool,

    // Interval between ConcurrentTransactions retries (C6).
    #[envconfig(default = "400")]
    pub kafka_txn_backoff_ms: u64,

    // Wall-clock ceiling on ConcurrentTransactions retries (C6, P7).
    #[envconfig(default = "5000")]
    pub kafka_txn_retry_window_ms: u64,

    // Post-commit propagation sleep on the pre-KIP-447 path.
    #[envconfig(default = "200")]
    pub kafka_post_commit_sleep_ms: u64,
}

impl TransactionConfig {
    pub fn txn_backoff(&self) -> Duration {
        Duration::from_millis(self.kafka_txn_backoff_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.kafka_txn_retry_window_ms)
    }

    pub fn post_commit_sleep(&self) -> Duration {
        Duration::from_millis(self.kafka_post_commit_sleep_ms)
    }

    pub fn is_transactional(&self) -> bool {
        self.kafka_txn_id.is_some()
    }
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str, auto_commit: bool) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };

        if std::env::var("KAFKA_CONSUMER_AUTO_COMMIT").is_err() {
            std::env::set_var("KAFKA_CONSUMER_AUTO_COMMIT", auto_commit.to_string());
        }
    }
}
