//! Transaction Session (C4): binds a group consumer to a transactional
//! producer so that a rebalance during a transaction forces an abort,
//! favoring correctness over throughput (spec §4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::collaborators::{GroupConsumer, OffsetMap, TxnProducer};
use crate::concurrent_retry::{with_concurrent_txn_retry, Outcome};
use crate::config::TransactionConfig;
use crate::error::{BeginError, BrokerErrorCode, ConcurrentTxnError, EndError, OffsetCommitError};
use crate::producer_id::{ProducerId, ProducerIdState};

/// Identifies one partition revoked/lost during a rebalance.
#[derive(Debug, Clone)]
pub struct PartitionRef {
    pub topic: String,
    pub partition: i32,
}

pub type RebalanceCallback = Arc<dyn Fn(&[PartitionRef]) + Send + Sync>;

struct RebalanceState {
    revoked: bool,
    revoked_notify: Arc<Notify>,
    lost: bool,
    lost_notify: Arc<Notify>,
}

impl RebalanceState {
    fn fresh() -> Self {
        Self {
            revoked: false,
            revoked_notify: Arc::new(Notify::new()),
            lost: false,
            lost_notify: Arc::new(Notify::new()),
        }
    }
}

struct CommitSlot {
    cancel: Arc<Notify>,
    done: Arc<Notify>,
}

/// The result of `End`: `(committed, result)`, matching spec §4.4's
/// `(committed bool, err error)` contract.
pub type EndResult = (bool, Result<(), EndError>);

pub struct TransactSession<P, G> {
    producer: Arc<P>,
    group: Arc<G>,
    producer_id: Arc<ProducerId>,
    config: TransactionConfig,
    group_id: String,
    cooperative: bool,

    in_txn: StdMutex<bool>,
    producing_txn: AtomicU32,

    rebalance: StdMutex<RebalanceState>,
    /// Interlocks rebalance observation with End's post-commit window
    /// (spec §9 "Rebalance <-> transaction interlock"). A binary
    /// semaphore rather than a plain mutex because the holder must
    /// sometimes release it from a detached background task after the
    /// acquiring call has already returned.
    session_lock: Arc<Semaphore>,

    offsets_added_to_txn: StdMutex<bool>,
    commit_slot: AsyncMutex<Option<CommitSlot>>,
    shutdown: Arc<Notify>,
}

impl<P, G> TransactSession<P, G>
where
    P: TxnProducer + 'static,
    G: GroupConsumer + 'static,
{
    /// Construction (spec §4.4 "Construction"): validates a group is
    /// configured, captures `cooperative`, and returns wrapped rebalance
    /// callbacks the caller registers with its consumer context.
    pub fn new(
        producer: Arc<P>,
        group: Arc<G>,
        producer_id: Arc<ProducerId>,
        config: TransactionConfig,
        group_id: String,
        cooperative: bool,
        shutdown: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            producer,
            group,
            producer_id,
            config,
            group_id,
            cooperative,
            in_txn: StdMutex::new(false),
            producing_txn: AtomicU32::new(0),
            rebalance: StdMutex::new(RebalanceState::fresh()),
            session_lock: Arc::new(Semaphore::new(1)),
            offsets_added_to_txn: StdMutex::new(false),
            commit_slot: AsyncMutex::new(None),
            shutdown,
        })
    }

    pub fn is_in_txn(&self) -> bool {
        *self.in_txn.lock().expect("in_txn mutex poisoned")
    }

    /// `producing_txn == 1 ⇒ in_txn == true` (P4).
    pub fn is_producing_txn(&self) -> bool {
        self.producing_txn.load(Ordering::SeqCst) == 1
    }

    /// For use from synchronous rebalance-callback contexts only (spec §9:
    /// librdkafka invokes these off the consumer's poll loop, not from a
    /// tokio task, so there is no executor to yield back to).
    fn blocking_acquire_session_permit(&self) -> tokio::sync::OwnedSemaphorePermit {
        futures::executor::block_on(self.session_lock.clone().acquire_owned())
            .expect("session semaphore never closes")
    }

    async fn acquire_session_permit(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.session_lock
            .clone()
            .acquire_owned()
            .await
            .expect("session semaphore never closes")
    }

    /// The wrapped `on_revoked` hook (spec §4.4 "Construction"). Runs
    /// synchronously on whatever thread the broker collaborator's
    /// rebalance callback fires on.
    pub fn on_revoked(&self, partitions: &[PartitionRef], user_on_revoked: Option<&RebalanceCallback>) {
        let _permit = self.blocking_acquire_session_permit();
        {
            let mut state = self.rebalance.lock().expect("rebalance mutex poisoned");
            if state.revoked {
                return;
            }
            if self.cooperative && partitions.is_empty() {
                debug!("cooperative empty revoke observed; not marking the session revoked");
            } else {
                state.revoked = true;
                state.revoked_notify.notify_waiters();
            }
        }
        if let Some(cb) = user_on_revoked {
            cb(partitions);
        }
    }

    /// The wrapped `on_lost` hook.
    pub fn on_lost(
        &self,
        partitions: &[PartitionRef],
        user_on_lost: Option<&RebalanceCallback>,
        user_on_revoked: Option<&RebalanceCallback>,
    ) {
        let _permit = self.blocking_acquire_session_permit();
        {
            let mut state = self.rebalance.lock().expect("rebalance mutex poisoned");
            if state.lost {
                return;
            }
            state.lost = true;
            state.lost_notify.notify_waiters();
        }
        match user_on_lost {
            Some(cb) => cb(partitions),
            None => {
                if let Some(cb) = user_on_revoked {
                    cb(partitions);
                }
            }
        }
    }

    /// Begin (spec §4.4 "Begin").
    pub fn begin(&self) -> Result<(), BeginError> {
        if !self.config.is_transactional() {
            return Err(BeginError::NotTransactional);
        }
        let mut in_txn = self.in_txn.lock().expect("in_txn mutex poisoned");
        if *in_txn {
            return Err(BeginError::AlreadyInTxn);
        }
        match &*self.producer_id.current() {
            ProducerIdState::Fatal(msg) => return Err(BeginError::ProducerIdFatal(msg.clone())),
            ProducerIdState::ReloadPending => {
                // The actual `InitProducerId` exchange lives in the
                // producer collaborator; this core only needs to observe
                // that recovery is pending, not fatal, and proceed.
                warn!("beginning a transaction while producer id reload is pending");
            }
            _ => {}
        }
        *in_txn = true;
        self.producing_txn.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// End (spec §4.4 "End(commit_intent)"): the hardest state machine in
    /// the system.
    pub async fn end(&self, commit_intent: bool) -> EndResult {
        // Step 1: deferred reset, applied via this guard's Drop so it runs
        // on every exit path, mirroring a `defer` in the source material.
        let _reset = DeferredReset { session: self };

        // Step 2.
        let flush_result = if commit_intent {
            self.producer.flush().await.map_err(EndError::Flush)
        } else {
            self.producer
                .abort_buffered_records()
                .await
                .map_err(EndError::AbortBuffered)
        };
        if let Err(e) = flush_result {
            return (false, Err(e));
        }

        // Step 3.
        let permit = self.acquire_session_permit().await;
        let failed = {
            let state = self.rebalance.lock().expect("rebalance mutex poisoned");
            state.revoked || state.lost
        };
        let precommit = self.group.committed_offsets().await;
        let postcommit = self.group.uncommitted_offsets().await;
        drop(permit);

        // Step 4.
        let mut fatal_commit_errors: Vec<BrokerErrorCode> = Vec::new();
        let mut has_abortable_commit_err = false;
        let mut kip447 = false;
        if commit_intent && !failed {
            match self.transactional_offset_commit(postcommit.clone()).await {
                Ok(response) => {
                    kip447 = response.is_kip447();
                    for err in response.partition_errors.values() {
                        if err.is_none() {
                            continue;
                        } else if err.is_abortable_commit_error() {
                            has_abortable_commit_err = true;
                        } else {
                            fatal_commit_errors.push(*err);
                        }
                    }
                }
                Err(e) => {
                    return (false, Err(EndError::OffsetCommit(Box::new(debug_err(e)))));
                }
            }
        }

        // Step 5.
        let ok_heartbeat = if commit_intent && !failed && fatal_commit_errors.is_empty() {
            self.force_heartbeat_racing_rebalance().await
        } else {
            false
        };

        // Step 6: acquire the interlock; its release policy is finalized
        // once the actual commit outcome is known, just below.
        let permit = self.acquire_session_permit().await;
        let kip447_stable = kip447 && self.config.kafka_require_stable_fetch_offsets;

        // Step 7.
        let try_commit = !failed
            && fatal_commit_errors.is_empty()
            && !has_abortable_commit_err
            && ok_heartbeat;
        let mut will_try_commit = commit_intent && try_commit;

        // Step 8.
        let mut end_txn_result = self.end_txn_with_retry(will_try_commit).await;
        if let Ok(response) = &end_txn_result {
            if response.is_operation_not_attempted() && will_try_commit {
                will_try_commit = false;
                end_txn_result = self.end_txn_with_retry(false).await;
            }
        }

        let committed =
            matches!(&end_txn_result, Ok(r) if r.error.is_none()) && will_try_commit;

        self.release_session_permit(permit, committed, kip447_stable);

        // Step 9.
        match &end_txn_result {
            Ok(response) if response.error.is_none() && will_try_commit => {
                self.group.set_offsets(postcommit).await;
            }
            _ => {
                self.group.set_offsets(precommit).await;
            }
        }

        // Step 10.
        info!(committed, has_abortable_commit_err, ok_heartbeat, "transaction ended");
        let outcome = match end_txn_result {
            Err(e) => (false, Err(EndError::EndTxn(Box::new(debug_err(e))))),
            Ok(response) if !response.error.is_none() => {
                (false, Err(EndError::EndTxn(Box::new(FormattedError(format!(
                    "end txn returned error code {:?}",
                    response.error
                ))))))
            }
            Ok(_) => {
                if let Some(err) = fatal_commit_errors.first() {
                    (
                        false,
                        Err(EndError::OffsetCommit(Box::new(FormattedError(format!(
                            "commit error code {err:?}"
                        ))))),
                    )
                } else {
                    (will_try_commit, Ok(()))
                }
            }
        };
        let result_label = match &outcome {
            (true, Ok(())) => "committed",
            (false, Ok(())) => "aborted",
            (_, Err(_)) => "error",
        };
        metrics::counter!("txn_end_total", "result" => result_label).increment(1);
        outcome
    }

    async fn force_heartbeat_racing_rebalance(&self) -> bool {
        let (revoked_notify, lost_notify, already) = {
            let state = self.rebalance.lock().expect("rebalance mutex poisoned");
            (state.revoked_notify.clone(), state.lost_notify.clone(), state.revoked || state.lost)
        };
        if already {
            return false;
        }
        tokio::select! {
            res = self.group.force_heartbeat() => res.is_ok(),
            _ = revoked_notify.notified() => false,
            _ = lost_notify.notified() => false,
        }
    }

    fn release_session_permit(
        &self,
        permit: tokio::sync::OwnedSemaphorePermit,
        committed: bool,
        kip447_stable: bool,
    ) {
        if kip447_stable {
            // Held until this function returns, i.e. dropped right here:
            // the whole point of the KIP-447 branch is that Kafka itself
            // blocks rebalance-time fetches until txn markers are
            // written, so no extra local delay is needed.
            drop(permit);
        } else if committed {
            let sleep_for = self.config.post_commit_sleep();
            tokio::spawn(async move {
                tokio::time::sleep(sleep_for).await;
                drop(permit);
            });
        } else {
            drop(permit);
        }
    }

    async fn end_txn_with_retry(
        &self,
        commit: bool,
    ) -> Result<crate::collaborators::EndTxnResponse, ConcurrentTxnError<Box<dyn std::error::Error + Send + Sync>>>
    {
        with_concurrent_txn_retry(
            "end_txn",
            self.config.txn_backoff(),
            self.config.retry_window(),
            &self.shutdown,
            || async {
                match self.group.end_txn(commit).await {
                    Ok(response) if response.error == BrokerErrorCode::CONCURRENT_TRANSACTIONS => {
                        Ok(Outcome::ConcurrentTransactions)
                    }
                    Ok(response) => Ok(Outcome::Done(response)),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    /// Transactional offset commit (spec §4.4.1).
    pub async fn transactional_offset_commit(
        &self,
        uncommitted: OffsetMap,
    ) -> Result<crate::collaborators::TxnOffsetCommitResponse, OffsetCommitError> {
        if !self.config.is_transactional() || !self.is_in_txn() {
            return Err(OffsetCommitError::NotInTxn);
        }
        if uncommitted.is_empty() {
            return Ok(crate::collaborators::TxnOffsetCommitResponse::default());
        }

        let prior = self.commit_slot.lock().await.take();
        if let Some(prior) = prior {
            prior.cancel.notify_waiters();
            prior.done.notified().await;
        }

        let cancel = Arc::new(Notify::new());
        let done = Arc::new(Notify::new());
        {
            let mut slot = self.commit_slot.lock().await;
            *slot = Some(CommitSlot { cancel: cancel.clone(), done: done.clone() });
        }

        let needs_add = !*self.offsets_added_to_txn.lock().expect("offsets_added_to_txn mutex poisoned");
        if needs_add {
            if let Err(e) = self.group.add_offsets_to_txn(&self.group_id).await {
                self.clear_commit_slot(&done).await;
                return Err(OffsetCommitError::AddOffsets(e));
            }
            *self.offsets_added_to_txn.lock().expect("offsets_added_to_txn mutex poisoned") = true;
        }

        let result = tokio::select! {
            res = self.group.txn_offset_commit(&self.group_id, &uncommitted) => {
                res.map_err(OffsetCommitError::Commit)
            }
            _ = cancel.notified() => Err(OffsetCommitError::Superseded),
        };

        self.clear_commit_slot(&done).await;
        result
    }

    async fn clear_commit_slot(&self, done: &Arc<Notify>) {
        let mut slot = self.commit_slot.lock().await;
        *slot = None;
        drop(slot);
        done.notify_waiters();
    }
}

struct DeferredReset<'a, P, G> {
    session: &'a TransactSession<P, G>,
}

impl<'a, P, G> Drop for DeferredReset<'a, P, G> {
    fn drop(&mut self) {
        let mut state = self.session.rebalance.lock().expect("rebalance mutex poisoned");
        *state = RebalanceState::fresh();
        drop(state);
        *self.session.in_txn.lock().expect("in_txn mutex poisoned") = false;
        self.session.producing_txn.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FormattedError(String);

impl std::fmt::Display for FormattedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::error::Error for FormattedError {}

fn debug_err<E: std::fmt::Debug>(e: E) -> FormattedError {
    FormattedError(format!("{e:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EndTxnResponse, TxnOffsetCommitResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct FakeProducer {
        flush_calls: AtomicUsize,
        abort_calls: AtomicUsize,
    }

    #[async_trait]
    impl TxnProducer for FakeProducer {
        async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.flush_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn abort_buffered_records(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.abort_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeGroup {
        end_txn_error: StdMutex<BrokerErrorCode>,
        end_txn_responses: StdMutex<std::collections::VecDeque<BrokerErrorCode>>,
        end_txn_calls: AtomicUsize,
        commit_errors: StdMutex<HashMap<(String, i32), BrokerErrorCode>>,
        heartbeat_ok: StdMutex<bool>,
        committed: StdMutex<OffsetMap>,
        set_offsets_calls: StdMutex<Vec<OffsetMap>>,
        block_commits: StdMutex<bool>,
        commit_block: Arc<Notify>,
        commit_call_count: AtomicUsize,
    }

    impl Default for FakeGroup {
        fn default() -> Self {
            Self {
                end_txn_error: StdMutex::new(BrokerErrorCode::NONE),
                end_txn_responses: StdMutex::new(std::collections::VecDeque::new()),
                end_txn_calls: AtomicUsize::new(0),
                commit_errors: StdMutex::new(HashMap::new()),
                heartbeat_ok: StdMutex::new(true),
                committed: StdMutex::new(OffsetMap::new()),
                set_offsets_calls: StdMutex::new(Vec::new()),
                block_commits: StdMutex::new(false),
                commit_block: Arc::new(Notify::new()),
                commit_call_count: AtomicUsize::new(0),
            }
        }
    }

    impl FakeGroup {
        fn set_committed(&self, offsets: OffsetMap) {
            *self.committed.lock().unwrap() = offsets;
        }

        fn queue_end_txn_responses(&self, codes: Vec<BrokerErrorCode>) {
            *self.end_txn_responses.lock().unwrap() = codes.into();
        }

        /// Makes the first call to `txn_offset_commit` block forever on
        /// `commit_block`, so a test can observe it being superseded by a
        /// second, overlapping commit instead of completing on its own.
        fn block_first_commit(&self) {
            *self.block_commits.lock().unwrap() = true;
        }
    }

    #[async_trait]
    impl GroupConsumer for FakeGroup {
        async fn committed_offsets(&self) -> OffsetMap {
            self.committed.lock().unwrap().clone()
        }
        async fn uncommitted_offsets(&self) -> OffsetMap {
            let mut map = OffsetMap::new();
            map.insert(
                ("t".to_string(), 0),
                crate::collaborators::OffsetAndEpoch { offset: 10, leader_epoch: 1 },
            );
            map
        }
        async fn set_offsets(&self, offsets: OffsetMap) {
            self.set_offsets_calls.lock().unwrap().push(offsets);
        }
        async fn force_heartbeat(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if *self.heartbeat_ok.lock().unwrap() {
                Ok(())
            } else {
                Err(Box::new(FormattedError("heartbeat failed".into())))
            }
        }
        async fn add_offsets_to_txn(&self, _group_id: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        async fn txn_offset_commit(
            &self,
            _group_id: &str,
            offsets: &OffsetMap,
        ) -> Result<TxnOffsetCommitResponse, Box<dyn std::error::Error + Send + Sync>> {
            let call_no = self.commit_call_count.fetch_add(1, Ordering::SeqCst);
            if call_no == 0 && *self.block_commits.lock().unwrap() {
                self.commit_block.notified().await;
            }
            let errors = self.commit_errors.lock().unwrap().clone();
            let mut partition_errors = HashMap::new();
            for key in offsets.keys() {
                let err = errors.get(key).copied().unwrap_or(BrokerErrorCode::NONE);
                partition_errors.insert(key.clone(), err);
            }
            Ok(TxnOffsetCommitResponse { version: 3, partition_errors })
        }
        async fn end_txn(&self, _commit: bool) -> Result<EndTxnResponse, Box<dyn std::error::Error + Send + Sync>> {
            self.end_txn_calls.fetch_add(1, Ordering::SeqCst);
            let queued = self.end_txn_responses.lock().unwrap().pop_front();
            let error = queued.unwrap_or_else(|| *self.end_txn_error.lock().unwrap());
            Ok(EndTxnResponse { error })
        }
    }

    fn session(
        cooperative: bool,
        require_stable: bool,
    ) -> Arc<TransactSession<FakeProducer, FakeGroup>> {
        let config = TransactionConfig {
            kafka_txn_id: Some("txn-1".to_string()),
            kafka_id_version: 4,
            kafka_cooperative: cooperative,
            kafka_require_stable_fetch_offsets: require_stable,
            kafka_txn_backoff_ms: 10,
            kafka_txn_retry_window_ms: 500,
            kafka_post_commit_sleep_ms: 5,
        };
        TransactSession::new(
            Arc::new(FakeProducer { flush_calls: AtomicUsize::new(0), abort_calls: AtomicUsize::new(0) }),
            Arc::new(FakeGroup::default()),
            Arc::new(ProducerId::new()),
            config,
            "group-1".to_string(),
            cooperative,
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn cooperative_empty_revoke_does_not_abort_a_later_commit() {
        let session = session(true, false);
        session.begin().unwrap();
        session.on_revoked(&[], None);

        let (committed, result) = session.end(true).await;
        assert!(result.is_ok());
        assert!(committed);
    }

    #[tokio::test]
    async fn revoke_forces_an_abort_even_when_commit_was_requested() {
        let session = session(false, false);
        session.begin().unwrap();
        session.on_revoked(&[PartitionRef { topic: "t".into(), partition: 0 }], None);

        let (committed, result) = session.end(true).await;
        assert!(result.is_ok());
        assert!(!committed);
    }

    #[tokio::test]
    async fn abortable_commit_error_results_in_abort_not_commit() {
        let session = session(false, false);
        session.begin().unwrap();
        // Seed a commit error directly on the fake group via its Arc.
        let fake = Arc::clone(&session.group);
        fake.commit_errors
            .lock()
            .unwrap()
            .insert(("t".to_string(), 0), BrokerErrorCode::REBALANCE_IN_PROGRESS);

        let (committed, result) = session.end(true).await;
        assert!(result.is_ok());
        assert!(!committed);
    }

    #[tokio::test]
    async fn begin_requires_transactional_id() {
        let config = TransactionConfig {
            kafka_txn_id: None,
            kafka_id_version: 4,
            kafka_cooperative: true,
            kafka_require_stable_fetch_offsets: false,
            kafka_txn_backoff_ms: 10,
            kafka_txn_retry_window_ms: 500,
            kafka_post_commit_sleep_ms: 5,
        };
        let session = TransactSession::new(
            Arc::new(FakeProducer { flush_calls: AtomicUsize::new(0), abort_calls: AtomicUsize::new(0) }),
            Arc::new(FakeGroup::default()),
            Arc::new(ProducerId::new()),
            config,
            "group-1".to_string(),
            true,
            Arc::new(Notify::new()),
        );
        assert!(matches!(session.begin(), Err(BeginError::NotTransactional)));
    }

    #[tokio::test]
    async fn begin_twice_is_rejected() {
        let session = session(true, false);
        session.begin().unwrap();
        assert!(matches!(session.begin(), Err(BeginError::AlreadyInTxn)));
    }

    #[tokio::test]
    async fn producing_txn_implies_in_txn() {
        let session = session(true, false);
        assert!(!session.is_producing_txn());
        session.begin().unwrap();
        assert!(session.is_producing_txn());
        assert!(session.is_in_txn());
        let _ = session.end(false).await;
        assert!(!session.is_producing_txn());
        assert!(!session.is_in_txn());
    }

    /// P8: at most one `TxnOffsetCommit` in flight per group; a new commit
    /// cancels the prior one and waits for it to unwind before proceeding.
    #[tokio::test]
    async fn a_new_commit_cancels_and_waits_for_the_prior_one() {
        let session = session(true, false);
        session.begin().unwrap();
        let fake = Arc::clone(&session.group);
        fake.block_first_commit();

        let mut offsets = OffsetMap::new();
        offsets.insert(
            ("t".to_string(), 0),
            crate::collaborators::OffsetAndEpoch { offset: 1, leader_epoch: 0 },
        );

        let session_for_first = Arc::clone(&session);
        let offsets_for_first = offsets.clone();
        let first = tokio::spawn(async move {
            session_for_first.transactional_offset_commit(offsets_for_first).await
        });

        // Let the spawned commit register itself in the commit slot and
        // block inside `txn_offset_commit` before the second one fires.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let second = session.transactional_offset_commit(offsets).await;
        assert!(second.is_ok());

        let first_result = first.await.expect("first commit task did not panic");
        assert!(matches!(first_result, Err(OffsetCommitError::Superseded)));
    }

    /// L2: Begin -> End(abort) restores the session to its pre-Begin
    /// offsets; anything produced/consumed during the aborted transaction
    /// (the "postcommit" snapshot) is discarded.
    #[tokio::test]
    async fn abort_restores_precommit_offsets_discarding_postcommit() {
        let session = session(true, false);
        session.begin().unwrap();
        let fake = Arc::clone(&session.group);
        let mut precommit = OffsetMap::new();
        precommit.insert(
            ("t".to_string(), 0),
            crate::collaborators::OffsetAndEpoch { offset: 3, leader_epoch: 0 },
        );
        fake.set_committed(precommit);

        let (committed, result) = session.end(false).await;
        assert!(result.is_ok());
        assert!(!committed);

        let calls = fake.set_offsets_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].get(&("t".to_string(), 0)).map(|e| e.offset), Some(3));
    }

    /// Scenario 5: End(commit) issues EndTxn, gets OperationNotAttempted
    /// back, and retries exactly once with `commit = false`.
    #[tokio::test]
    async fn operation_not_attempted_retries_end_txn_once_with_abort() {
        let session = session(false, false);
        session.begin().unwrap();
        let fake = Arc::clone(&session.group);
        fake.queue_end_txn_responses(vec![
            BrokerErrorCode::OPERATION_NOT_ATTEMPTED,
            BrokerErrorCode::NONE,
        ]);

        let (committed, result) = session.end(true).await;
        assert!(result.is_ok());
        assert!(!committed);
        assert_eq!(fake.end_txn_calls.load(Ordering::SeqCst), 2);
    }
}
