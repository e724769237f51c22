use thiserror::Error;

/// Errors surfaced by the metadata refresh loop (C2) and topic snapshot
/// merge (C3). A "retriable" metadata error asks the loop to try again
/// without backing off; anything else goes through `retry_backoff`.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("fetching metadata: {0}")]
    Fetch(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("client is shutting down")]
    ShuttingDown,
}

/// Per-topic / per-partition error classes consumed during a merge (C3),
/// mirrored from the Kafka protocol's retriable/non-retriable split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorClass {
    Retriable,
    NonRetriable,
}

/// A broker-reported error code, opaque to this crate beyond its
/// retriability and its membership in the "abortable at commit" set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerErrorCode(pub i16);

impl BrokerErrorCode {
    pub const NONE: BrokerErrorCode = BrokerErrorCode(0);
    pub const UNKNOWN_PRODUCER_ID: BrokerErrorCode = BrokerErrorCode(59);
    pub const INVALID_PRODUCER_ID_MAPPING: BrokerErrorCode = BrokerErrorCode(49);
    pub const INVALID_PRODUCER_EPOCH: BrokerErrorCode = BrokerErrorCode(47);
    pub const ILLEGAL_GENERATION: BrokerErrorCode = BrokerErrorCode(22);
    pub const REBALANCE_IN_PROGRESS: BrokerErrorCode = BrokerErrorCode(27);
    pub const COORDINATOR_NOT_AVAILABLE: BrokerErrorCode = BrokerErrorCode(15);
    pub const COORDINATOR_LOAD_IN_PROGRESS: BrokerErrorCode = BrokerErrorCode(14);
    pub const NOT_COORDINATOR: BrokerErrorCode = BrokerErrorCode(16);
    pub const CONCURRENT_TRANSACTIONS: BrokerErrorCode = BrokerErrorCode(51);
    pub const OPERATION_NOT_ATTEMPTED: BrokerErrorCode = BrokerErrorCode(55);
    pub const PARTITION_DELETED: BrokerErrorCode = BrokerErrorCode(-1);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Errors that, when returned by a `TxnOffsetCommit`, make End prefer
    /// abort over commit (spec §4.4 step 4 / §7 "Commit-abortable").
    pub fn is_abortable_commit_error(self) -> bool {
        matches!(
            self,
            Self::ILLEGAL_GENERATION
                | Self::REBALANCE_IN_PROGRESS
                | Self::COORDINATOR_NOT_AVAILABLE
                | Self::COORDINATOR_LOAD_IN_PROGRESS
                | Self::NOT_COORDINATOR
        )
    }
}

/// Errors returned by `TransactSession::begin`.
#[derive(Debug, Error)]
pub enum BeginError {
    #[error("transactional id is not configured")]
    NotTransactional,
    #[error("a transaction is already in progress")]
    AlreadyInTxn,
    #[error("producer id is in a fatal state: {0}")]
    ProducerIdFatal(String),
}

/// Errors returned by `TransactSession::end`.
#[derive(Debug, Error)]
pub enum EndError {
    #[error("flush failed: {0}")]
    Flush(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("abort of buffered records failed: {0}")]
    AbortBuffered(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("transactional offset commit failed: {0}")]
    OffsetCommit(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("end transaction failed: {0}")]
    EndTxn(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("group heartbeat failed: {0}")]
    Heartbeat(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("caller context cancelled")]
    Cancelled,
}

/// Errors from the transactional offset commit path (§4.4.1).
#[derive(Debug, Error)]
pub enum OffsetCommitError {
    #[error("add offsets to txn failed: {0}")]
    AddOffsets(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("txn offset commit failed: {0}")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("commit was superseded by a newer one")]
    Superseded,
    #[error("not in a transaction")]
    NotInTxn,
}

/// Producer-ID recovery classification result (§4.5).
#[derive(Debug, Error)]
pub enum ProducerIdError {
    #[error("fatal producer id error: {0}")]
    Fatal(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("producer id reload is pending")]
    ReloadPending,
}

/// Errors bubbled out of the bounded concurrent-transaction retry envelope (C6).
#[derive(Debug, Error)]
pub enum ConcurrentTxnError<E> {
    #[error("operation failed: {0}")]
    Inner(E),
    #[error("client is shutting down")]
    ShuttingDown,
    #[error("still seeing ConcurrentTransactions after the retry window elapsed")]
    WindowExceeded,
}
