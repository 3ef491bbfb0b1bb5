//! The per-shard commit pipeline.
//!
//! Three ordered queues form one logical open-transaction FIFO:
//! `pending_transactions` (READY through CAN_COMMIT_COMPLETE, plus the
//! transient PRE_COMMIT_PENDING head), `pending_commits`
//! (PRE_COMMIT_COMPLETE, ordered for local commit) and
//! `pending_finish_commits` (COMMIT_PENDING, awaiting replication
//! consensus). Validation and preparation always run against the `tip`:
//! the root produced by the most recently prepared candidate, or the
//! committed tree root when nothing is pending.

use crate::cohort::{CohortState, CommitCallback, CommitCohort, StepCallback};
use crate::config::ShardConfig;
use crate::error::PipelineError;
use canopy_cohort::{affected_cohorts, CohortCoordinator, CohortRegistry};
use canopy_common::{Ticker, TransactionId};
use canopy_log::{Payload, PayloadKey, Replicated, ReplicationLog};
use canopy_tree::{prepare, validate, Candidate, Modification, Node, Tree};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process at most this many transactions in a single synchronous batch.
/// Past the cap a continuation is scheduled on the owner queue instead of
/// advancing further, bounding the work done per entry into the pipeline.
pub const MAX_TRANSACTION_BATCH: usize = 100;

/// Re-marshals pipeline tasks onto the single-owner execution context.
/// Completion callbacks of asynchronous work must go through this; they
/// never touch pipeline state from another task.
pub trait PipelineHost: Send + Sync {
    fn submit(&self, task: Box<dyn FnOnce(&mut CommitPipeline) + Send>);
}

struct QueueEntry {
    cohort: CommitCohort,
    last_access: u64,
}

enum Location {
    Finish(usize),
    Commits(usize),
    Transactions(usize),
}

/// The commit pipeline of one shard.
pub struct CommitPipeline {
    config: ShardConfig,
    tree: Tree,
    registry: CohortRegistry,
    tip: Arc<Node>,
    pending_transactions: VecDeque<QueueEntry>,
    pending_commits: VecDeque<QueueEntry>,
    pending_finish_commits: VecDeque<QueueEntry>,
    /// Callbacks to run once a non-commit payload reaches consensus.
    replication_callbacks: HashMap<PayloadKey, Box<dyn FnOnce() + Send>>,
    /// Failures of entries that were dequeued before their owner asked
    /// about them (rebase, expiry). Claimed by the next operation
    /// against the transaction.
    unclaimed_failures: HashMap<TransactionId, PipelineError>,
    log: ReplicationLog,
    ticker: Arc<dyn Ticker>,
    host: Arc<dyn PipelineHost>,
    listeners: Vec<mpsc::UnboundedSender<Arc<Candidate>>>,
    run_when_idle: Option<Box<dyn FnOnce() + Send>>,
    current_batch: usize,
}

impl CommitPipeline {
    pub fn new(
        config: ShardConfig,
        tree: Tree,
        log: ReplicationLog,
        ticker: Arc<dyn Ticker>,
        host: Arc<dyn PipelineHost>,
    ) -> Self {
        let tip = tree.root().clone();
        Self {
            config,
            tree,
            registry: CohortRegistry::new(),
            tip,
            pending_transactions: VecDeque::new(),
            pending_commits: VecDeque::new(),
            pending_finish_commits: VecDeque::new(),
            replication_callbacks: HashMap::new(),
            unclaimed_failures: HashMap::new(),
            log,
            ticker,
            host,
            listeners: Vec::new(),
            run_when_idle: None,
            current_batch: 0,
        }
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Current speculative tip.
    pub fn tip(&self) -> &Arc<Node> {
        &self.tip
    }

    pub fn registry_mut(&mut self) -> &mut CohortRegistry {
        &mut self.registry
    }

    pub fn queue_size(&self) -> usize {
        self.pending_transactions.len() + self.pending_commits.len()
            + self.pending_finish_commits.len()
    }

    /// Subscribe to committed candidates.
    pub fn register_listener(&mut self) -> mpsc::UnboundedReceiver<Arc<Candidate>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.push(sender);
        receiver
    }

    fn now(&self) -> u64 {
        self.ticker.read()
    }

    fn shard(&self) -> &str {
        &self.config.shard_name
    }

    fn position_in(queue: &VecDeque<QueueEntry>, id: &TransactionId) -> Option<usize> {
        queue.iter().position(|entry| entry.cohort.id() == id)
    }

    /// Append a readied transaction to the queue. The registry is
    /// snapshotted here so registrations added later do not affect this
    /// transaction.
    pub fn enqueue_ready_transaction(
        &mut self,
        id: TransactionId,
        modification: Arc<Modification>,
        participating_shards: Option<BTreeSet<String>>,
    ) {
        tracing::debug!("{}: readying transaction {}", self.shard(), id);
        let cohort = CommitCohort::new(
            id,
            modification,
            participating_shards,
            self.registry.snapshot(),
        );
        let last_access = self.now();
        self.pending_transactions
            .push_back(QueueEntry { cohort, last_access });
    }

    /// Request validation of a readied transaction. The callback fires
    /// once the transaction reaches the head of the queue and is
    /// validated against the tip.
    pub fn start_can_commit(&mut self, id: &TransactionId, callback: StepCallback) {
        self.current_batch = 0;
        let Some(position) = Self::position_in(&self.pending_transactions, id) else {
            let failure = self.claim_failure(id).unwrap_or_else(|| {
                PipelineError::ContractViolation(format!(
                    "canCommit for transaction {} which is not enqueued",
                    id
                ))
            });
            callback(Err(failure));
            return;
        };

        if let Some(failure) = self.pending_transactions[position].cohort.failure().cloned() {
            self.pending_transactions.remove(position);
            callback(Err(failure));
            self.process_next_pending_transaction();
            return;
        }

        let state = self.pending_transactions[position].cohort.state();
        if state != CohortState::Ready {
            let message = format!("canCommit for {} in state {}", id, state.name());
            tracing::error!("{}: {}", self.shard(), message);
            callback(Err(PipelineError::ContractViolation(message)));
            return;
        }

        let now = self.now();
        {
            let entry = &mut self.pending_transactions[position];
            entry.cohort.set_state(CohortState::CanCommitPending);
            entry.cohort.set_step_callback(callback);
            entry.last_access = now;
        }

        if position != 0 {
            self.try_promote(position);
        }
        self.process_next_pending_transaction();
    }

    /// Deadlock-avoidance reordering: a queued transaction may jump ahead
    /// of a blocked head when the subset of its declared participating
    /// shards preceding this shard's name exactly equals the head's.
    fn try_promote(&mut self, position: usize) {
        let own = self.config.shard_name.clone();
        {
            let head = &self.pending_transactions[0];
            if head.cohort.state() != CohortState::Ready {
                return;
            }
            let (Some(head_preceding), Some(candidate_preceding)) = (
                head.cohort.preceding_shards(&own),
                self.pending_transactions[position].cohort.preceding_shards(&own),
            ) else {
                return;
            };
            if head_preceding != candidate_preceding {
                return;
            }
        }

        let entry = self.pending_transactions.remove(position).unwrap();
        tracing::debug!(
            "{}: promoting transaction {} ahead of blocked head",
            self.shard(),
            entry.cohort.id()
        );
        self.pending_transactions.push_front(entry);
    }

    fn process_next_pending_transaction(&mut self) {
        loop {
            self.current_batch += 1;
            if self.current_batch > MAX_TRANSACTION_BATCH {
                tracing::debug!(
                    "{}: batch limit reached, scheduling continuation",
                    self.shard()
                );
                self.host
                    .submit(Box::new(|pipeline| pipeline.resume_next_pending()));
                return;
            }

            enum Next {
                Sweep,
                Validate,
                Stop,
            }
            let next = match self.pending_transactions.front() {
                None => Next::Stop,
                Some(entry) if entry.cohort.is_failed() => Next::Sweep,
                Some(entry) if entry.cohort.state() == CohortState::CanCommitPending => {
                    Next::Validate
                }
                Some(_) => Next::Stop,
            };

            match next {
                Next::Stop => break,
                Next::Sweep => {
                    self.sweep_failed(|pipeline| pipeline.pending_transactions.pop_front());
                    continue;
                }
                Next::Validate => {
                    let result = {
                        let entry = self.pending_transactions.front().unwrap();
                        tracing::debug!(
                            "{}: validating transaction {}",
                            self.shard(),
                            entry.cohort.id()
                        );
                        validate(&self.tip, entry.cohort.modification())
                    };
                    match result {
                        Ok(()) => {
                            let now = self.now();
                            let entry = self.pending_transactions.front_mut().unwrap();
                            tracing::debug!(
                                "{}: transaction {} validated",
                                self.config.shard_name,
                                entry.cohort.id()
                            );
                            entry.cohort.set_state(CohortState::CanCommitComplete);
                            entry.last_access = now;
                            if let Some(callback) = entry.cohort.take_step_callback() {
                                callback(Ok(()));
                            }
                            // The head now waits for its preCommit request.
                            break;
                        }
                        Err(e) => {
                            // Fail only this entry and loop to the next one.
                            let mut entry = self.pending_transactions.pop_front().unwrap();
                            tracing::warn!(
                                "{}: transaction {} failed validation: {}",
                                self.shard(),
                                entry.cohort.id(),
                                e
                            );
                            let failure = PipelineError::Validation(e);
                            entry.cohort.record_failure(failure.clone());
                            if let Some(callback) = entry.cohort.take_step_callback() {
                                callback(Err(failure));
                            }
                            continue;
                        }
                    }
                }
            }
        }
        self.maybe_run_when_idle();
    }

    /// Remove a failed entry, flushing any callbacks it still holds. A
    /// failure nobody was waiting on is stashed for the owner's next
    /// operation against the transaction.
    fn sweep_failed(
        &mut self,
        pop: impl FnOnce(&mut Self) -> Option<QueueEntry>,
    ) {
        let Some(mut entry) = pop(self) else { return };
        let failure = entry
            .cohort
            .failure()
            .cloned()
            .unwrap_or(PipelineError::Aborted);
        tracing::debug!(
            "{}: removing failed transaction {}",
            self.shard(),
            entry.cohort.id()
        );
        if let Some(mut coordinator) = entry.cohort.take_coordinator() {
            tokio::spawn(async move { coordinator.abort().await });
        }
        let mut delivered = false;
        if let Some(callback) = entry.cohort.take_step_callback() {
            callback(Err(failure.clone()));
            delivered = true;
        }
        if let Some(callback) = entry.cohort.take_commit_callback() {
            callback(Err(failure.clone()));
            delivered = true;
        }
        if !delivered {
            self.unclaimed_failures
                .insert(entry.cohort.id().clone(), failure);
        }
    }

    /// Claim a stashed failure for `id`, if any.
    fn claim_failure(&mut self, id: &TransactionId) -> Option<PipelineError> {
        self.unclaimed_failures.remove(id)
    }

    /// Continuation entry point scheduled when a batch hits the cap.
    pub fn resume_next_pending(&mut self) {
        tracing::debug!("{}: resuming transaction processing", self.shard());
        self.current_batch = 0;
        self.process_next_pending();
    }

    fn process_next_pending(&mut self) {
        self.process_next_pending_commit();
        self.process_next_pending_transaction();
    }

    /// Prepare the head transaction against the tip, consulting affected
    /// external cohorts when the candidate touches registrations.
    pub fn start_pre_commit(&mut self, id: &TransactionId, callback: StepCallback) {
        self.current_batch = 0;
        let Some(position) = Self::position_in(&self.pending_transactions, id) else {
            let failure = self.claim_failure(id).unwrap_or_else(|| {
                PipelineError::ContractViolation(format!(
                    "preCommit for transaction {} which is not enqueued",
                    id
                ))
            });
            callback(Err(failure));
            return;
        };

        if let Some(failure) = self.pending_transactions[position].cohort.failure().cloned() {
            self.pending_transactions.remove(position);
            callback(Err(failure));
            self.process_next_pending();
            return;
        }

        if position != 0 {
            let message = format!("preCommit for {} while it is not at the head", id);
            tracing::error!("{}: {}", self.shard(), message);
            callback(Err(PipelineError::ContractViolation(message)));
            return;
        }
        let state = self.pending_transactions[0].cohort.state();
        if state != CohortState::CanCommitComplete {
            let message = format!("preCommit for {} in state {}", id, state.name());
            tracing::error!("{}: {}", self.shard(), message);
            callback(Err(PipelineError::ContractViolation(message)));
            return;
        }

        tracing::debug!("{}: preparing transaction {}", self.shard(), id);
        let prepared = {
            let entry = self.pending_transactions.front().unwrap();
            prepare(&self.tip, entry.cohort.modification())
        };
        let candidate = match prepared {
            Ok(candidate) => Arc::new(candidate),
            Err(e) => {
                self.failed_pre_commit(PipelineError::Validation(e), Some(callback));
                return;
            }
        };

        let now = self.now();
        let messages = {
            let entry = self.pending_transactions.front_mut().unwrap();
            entry.cohort.set_state(CohortState::PreCommitPending);
            entry.cohort.set_candidate(candidate.clone());
            entry.cohort.set_step_callback(callback);
            entry.last_access = now;
            affected_cohorts(entry.cohort.registry_snapshot(), &candidate)
        };

        if messages.is_empty() {
            // No affected cohorts: the phase completes without
            // round-trips.
            self.complete_pre_commit();
            return;
        }

        tracing::debug!(
            "{}: transaction {} affects {} cohorts",
            self.shard(),
            id,
            messages.len()
        );
        let mut coordinator =
            CohortCoordinator::new(id.clone(), messages, self.config.cohort_timeouts.clone());
        let host = self.host.clone();
        let tx = id.clone();
        tokio::spawn(async move {
            let outcome = match coordinator.can_commit().await {
                Ok(()) => coordinator.pre_commit().await,
                Err(e) => Err(e),
            };
            host.submit(Box::new(move |pipeline| {
                pipeline.finish_remote_pre_commit(tx, coordinator, outcome)
            }));
        });
    }

    /// Re-entry point for the cohort round-trips started by
    /// [`Self::start_pre_commit`].
    pub fn finish_remote_pre_commit(
        &mut self,
        id: TransactionId,
        coordinator: CohortCoordinator,
        outcome: Result<(), canopy_cohort::CohortError>,
    ) {
        self.current_batch = 0;
        let head_matches = self
            .pending_transactions
            .front()
            .map(|entry| {
                entry.cohort.id() == &id && entry.cohort.state() == CohortState::PreCommitPending
            })
            .unwrap_or(false);
        if !head_matches {
            tracing::debug!(
                "{}: dropping late cohort completion for {}",
                self.shard(),
                id
            );
            if outcome.is_ok() {
                // The entry expired or was aborted meanwhile; release the
                // cohorts that already agreed.
                let mut coordinator = coordinator;
                tokio::spawn(async move { coordinator.abort().await });
            }
            self.process_next_pending();
            return;
        }

        match outcome {
            Ok(()) => {
                self.pending_transactions
                    .front_mut()
                    .unwrap()
                    .cohort
                    .set_coordinator(coordinator);
                self.complete_pre_commit();
            }
            Err(e) => self.failed_pre_commit(PipelineError::Cohort(e), None),
        }
    }

    fn failed_pre_commit(&mut self, failure: PipelineError, callback: Option<StepCallback>) {
        let mut entry = self.pending_transactions.pop_front().unwrap();
        tracing::warn!(
            "{}: transaction {} failed to prepare: {}",
            self.shard(),
            entry.cohort.id(),
            failure
        );
        entry.cohort.record_failure(failure.clone());
        let callback = callback.or_else(|| entry.cohort.take_step_callback());
        if let Some(callback) = callback {
            callback(Err(failure));
        }
        self.process_next_pending_transaction();
    }

    /// Head transaction is prepared: advance the tip and move it to the
    /// local commit queue.
    fn complete_pre_commit(&mut self) {
        let now = self.now();
        let mut entry = self.pending_transactions.pop_front().unwrap();
        let candidate = entry.cohort.candidate().cloned().unwrap();
        self.tip = candidate.root_after().clone();
        entry.cohort.set_state(CohortState::PreCommitComplete);
        entry.last_access = now;
        tracing::debug!(
            "{}: transaction {} prepared",
            self.shard(),
            entry.cohort.id()
        );
        if let Some(callback) = entry.cohort.take_step_callback() {
            callback(Ok(()));
        }
        self.pending_commits.push_back(entry);
        self.process_next_pending_transaction();
    }

    /// Request submission of a prepared transaction to the replication
    /// log. The callback resolves with the log index once consensus is
    /// reached and the candidate applied locally.
    pub fn start_commit(&mut self, id: &TransactionId, callback: CommitCallback) {
        self.current_batch = 0;
        let Some(position) = Self::position_in(&self.pending_commits, id) else {
            let failure = self.claim_failure(id).unwrap_or_else(|| {
                PipelineError::ContractViolation(format!(
                    "commit for transaction {} which is not prepared",
                    id
                ))
            });
            callback(Err(failure));
            return;
        };

        if let Some(failure) = self.pending_commits[position].cohort.failure().cloned() {
            self.pending_commits.remove(position);
            callback(Err(failure));
            self.process_next_pending();
            return;
        }

        let state = self.pending_commits[position].cohort.state();
        if state != CohortState::PreCommitComplete {
            let message = format!("commit for {} in state {}", id, state.name());
            tracing::error!("{}: {}", self.shard(), message);
            callback(Err(PipelineError::ContractViolation(message)));
            return;
        }

        self.pending_commits[position]
            .cohort
            .set_commit_callback(callback);
        if position == 0 {
            self.process_next_pending_commit();
        } else {
            tracing::debug!(
                "{}: transaction {} scheduled for commit step",
                self.shard(),
                id
            );
        }
    }

    fn process_next_pending_commit(&mut self) {
        loop {
            enum Next {
                Sweep,
                Submit,
                Stop,
            }
            let next = match self.pending_commits.front() {
                None => Next::Stop,
                Some(entry) if entry.cohort.is_failed() => Next::Sweep,
                Some(entry)
                    if entry.cohort.state() == CohortState::PreCommitComplete
                        && entry.cohort.commit_requested() =>
                {
                    Next::Submit
                }
                Some(_) => Next::Stop,
            };
            match next {
                Next::Stop => break,
                Next::Sweep => {
                    self.sweep_failed(|pipeline| pipeline.pending_commits.pop_front());
                    continue;
                }
                Next::Submit => {
                    self.submit_next_commit();
                    continue;
                }
            }
        }
        self.maybe_run_when_idle();
    }

    fn submit_next_commit(&mut self) {
        // Progress transactions pending canCommit first so transactions
        // that immediately chain into their commit step reach
        // COMMIT_PENDING in time to batch with this payload.
        self.process_next_pending_transaction();

        let now = self.now();
        let mut entry = self.pending_commits.pop_front().unwrap();
        let id = entry.cohort.id().clone();
        let candidate = entry.cohort.candidate().cloned().unwrap();
        let payload = Payload::CommitTransaction {
            id: id.clone(),
            candidate,
        };

        // Hint that the next submission follows immediately if the new
        // head is already waiting for its commit.
        let batch_hint = self
            .pending_commits
            .front()
            .map(|next| {
                next.cohort.state() == CohortState::PreCommitComplete
                    && next.cohort.commit_requested()
            })
            .unwrap_or(false);

        match self.log.submit(&payload, batch_hint) {
            Ok(index) => {
                entry.cohort.set_state(CohortState::CommitPending);
                entry.cohort.set_log_index(index);
                entry.last_access = now;
                tracing::debug!(
                    "{}: transaction {} submitted to replication at index {}",
                    self.shard(),
                    id,
                    index
                );
                self.pending_finish_commits.push_back(entry);
            }
            Err(e) => {
                tracing::error!(
                    "{}: failed to submit transaction {} for replication: {}",
                    self.shard(),
                    id,
                    e
                );
                let failure = PipelineError::Replication(e.to_string());
                entry.cohort.record_failure(failure.clone());
                if let Some(callback) = entry.cohort.take_commit_callback() {
                    callback(Err(failure));
                }
            }
        }
    }

    /// Replicate a non-commit payload, invoking `callback` once it
    /// reaches consensus.
    pub fn replicate(
        &mut self,
        payload: Payload,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<(), PipelineError> {
        let key = payload.key();
        self.replication_callbacks.insert(key.clone(), callback);
        if let Err(e) = self.log.submit(&payload, false) {
            self.replication_callbacks.remove(&key);
            return Err(PipelineError::Replication(e.to_string()));
        }
        Ok(())
    }

    /// Entry point for consensus outcomes delivered by the replication
    /// log subscription.
    pub fn apply_replicated(&mut self, replicated: Replicated) {
        self.current_batch = 0;
        match replicated.payload {
            Payload::CommitTransaction { id, .. } => self.payload_replication_complete(&id),
            other => {
                let key = other.key();
                match self.replication_callbacks.remove(&key) {
                    Some(callback) => {
                        tracing::debug!(
                            "{}: replication of {} completed",
                            self.shard(),
                            other
                        );
                        callback();
                    }
                    None => {
                        tracing::debug!(
                            "{}: replication of {} has no callback",
                            self.shard(),
                            other
                        );
                    }
                }
            }
        }
    }

    fn payload_replication_complete(&mut self, id: &TransactionId) {
        match self.pending_finish_commits.front() {
            None => {
                tracing::warn!(
                    "{}: no outstanding transactions, ignoring consensus on {}",
                    self.shard(),
                    id
                );
                return;
            }
            Some(entry) if entry.cohort.id() != id => {
                tracing::debug!(
                    "{}: head of finish-commit queue is {}, ignoring consensus on {}",
                    self.shard(),
                    entry.cohort.id(),
                    id
                );
                return;
            }
            Some(_) => {}
        }
        self.finish_commit();
    }

    fn finish_commit(&mut self) {
        let mut entry = self.pending_finish_commits.pop_front().unwrap();
        let id = entry.cohort.id().clone();
        let candidate = entry.cohort.candidate().cloned().unwrap();
        tracing::debug!("{}: resuming commit of transaction {}", self.shard(), id);

        if let Err(e) = self.tree.commit(&candidate) {
            tracing::error!(
                "{}: failed to commit transaction {}: {}",
                self.shard(),
                id,
                e
            );
            let failure = PipelineError::Commit(e);
            entry.cohort.record_failure(failure.clone());
            if let Some(callback) = entry.cohort.take_commit_callback() {
                callback(Err(failure));
            }
            self.process_next_pending();
            return;
        }

        entry.cohort.set_state(CohortState::Committed);
        if let Some(mut coordinator) = entry.cohort.take_coordinator() {
            let shard = self.config.shard_name.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.commit().await {
                    tracing::warn!("{}: cohort commit incomplete: {}", shard, e);
                }
            });
        }
        self.listeners
            .retain(|listener| listener.send(candidate.clone()).is_ok());
        let index = entry.cohort.log_index().unwrap_or_default();
        if let Some(callback) = entry.cohort.take_commit_callback() {
            callback(Ok(index));
        }
        tracing::debug!("{}: transaction {} committed", self.shard(), id);
        self.process_next_pending();
    }

    /// Abort a queued transaction. Returns false when the transaction has
    /// already been submitted for replication and can only await its
    /// outcome.
    pub fn start_abort(&mut self, id: &TransactionId, callback: Option<StepCallback>) -> bool {
        self.current_batch = 0;
        let location = Self::position_in(&self.pending_finish_commits, id)
            .map(Location::Finish)
            .or_else(|| Self::position_in(&self.pending_commits, id).map(Location::Commits))
            .or_else(|| {
                Self::position_in(&self.pending_transactions, id).map(Location::Transactions)
            });
        let Some(location) = location else {
            tracing::debug!(
                "{}: no open transaction while attempting to abort {}",
                self.shard(),
                id
            );
            // A stashed failure is moot once the owner aborts.
            self.unclaimed_failures.remove(id);
            if let Some(callback) = callback {
                callback(Ok(()));
            }
            return true;
        };

        let state = match &location {
            Location::Finish(i) => self.pending_finish_commits[*i].cohort.state(),
            Location::Commits(i) => self.pending_commits[*i].cohort.state(),
            Location::Transactions(i) => self.pending_transactions[*i].cohort.state(),
        };
        if state == CohortState::CommitPending {
            tracing::warn!(
                "{}: transaction {} is committing, skipping abort",
                self.shard(),
                id
            );
            if let Some(callback) = callback {
                callback(Err(PipelineError::Committing));
            }
            return false;
        }

        let new_tip = self.tip_preceding(&location);
        let removed = match location {
            Location::Finish(i) => {
                // Unreachable in practice: finish-commit entries are
                // COMMIT_PENDING and refused above.
                self.pending_finish_commits.remove(i).unwrap()
            }
            Location::Commits(i) => {
                let removed = self.pending_commits.remove(i).unwrap();
                if removed.cohort.candidate().is_some() && !removed.cohort.is_failed() {
                    let mut tip = new_tip;
                    let shard = self.config.shard_name.clone();
                    Self::rebase_entries(&shard, &mut tip, self.pending_commits.iter_mut().skip(i));
                    Self::rebase_entries(&shard, &mut tip, self.pending_transactions.iter_mut());
                    self.tip = tip;
                }
                removed
            }
            Location::Transactions(i) => {
                let removed = self.pending_transactions.remove(i).unwrap();
                if removed.cohort.candidate().is_some() && !removed.cohort.is_failed() {
                    let mut tip = new_tip;
                    let shard = self.config.shard_name.clone();
                    Self::rebase_entries(
                        &shard,
                        &mut tip,
                        self.pending_transactions.iter_mut().skip(i),
                    );
                    self.tip = tip;
                }
                removed
            }
        };

        tracing::debug!("{}: aborted queued transaction {}", self.shard(), id);
        self.finish_abort(removed, callback);
        self.process_next_pending();
        true
    }

    fn finish_abort(&mut self, mut entry: QueueEntry, callback: Option<StepCallback>) {
        if let Some(mut coordinator) = entry.cohort.take_coordinator() {
            tokio::spawn(async move { coordinator.abort().await });
        }
        // Any operation still outstanding on this transaction resolves as
        // aborted.
        if let Some(pending) = entry.cohort.take_step_callback() {
            pending(Err(PipelineError::Aborted));
        }
        if let Some(pending) = entry.cohort.take_commit_callback() {
            pending(Err(PipelineError::Aborted));
        }
        entry.cohort.set_state(CohortState::Aborted);
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    /// The tip that would result from committing everything queued ahead
    /// of `location`: the candidate of the closest preceding prepared
    /// entry, or the committed tree root.
    fn tip_preceding(&self, location: &Location) -> Arc<Node> {
        let mut tip = self.tree.root().clone();
        let (finish_limit, commits_limit, transactions_limit) = match location {
            Location::Finish(i) => (*i, 0, 0),
            Location::Commits(i) => (usize::MAX, *i, 0),
            Location::Transactions(i) => (usize::MAX, usize::MAX, *i),
        };
        let chained = self
            .pending_finish_commits
            .iter()
            .take(finish_limit)
            .chain(self.pending_commits.iter().take(commits_limit))
            .chain(self.pending_transactions.iter().take(transactions_limit));
        for entry in chained {
            // Failed entries have already been dropped from the
            // speculative chain.
            if entry.cohort.is_failed() {
                continue;
            }
            if let Some(candidate) = entry.cohort.candidate() {
                tip = candidate.root_after().clone();
            }
        }
        tip
    }

    /// Re-validate / re-prepare the entries that depended on an aborted
    /// predecessor's candidate. A failure here fails only the entry it
    /// belongs to; later entries continue against the tip excluding it.
    fn rebase_entries<'a>(
        shard: &str,
        tip: &mut Arc<Node>,
        entries: impl Iterator<Item = &'a mut QueueEntry>,
    ) {
        for entry in entries {
            match entry.cohort.state() {
                CohortState::CanCommitComplete => {
                    tracing::debug!(
                        "{}: revalidating queued transaction {}",
                        shard,
                        entry.cohort.id()
                    );
                    if let Err(e) = validate(tip, entry.cohort.modification()) {
                        tracing::debug!(
                            "{}: failed to revalidate queued transaction {}: {}",
                            shard,
                            entry.cohort.id(),
                            e
                        );
                        entry.cohort.record_failure(PipelineError::Validation(e));
                    }
                }
                CohortState::PreCommitPending => {
                    // Cohort round-trips for the old candidate are in
                    // flight; the candidate they agreed to no longer
                    // exists.
                    entry
                        .cohort
                        .record_failure(PipelineError::CandidateInvalidated);
                }
                CohortState::PreCommitComplete => {
                    tracing::debug!(
                        "{}: repreparing queued transaction {}",
                        shard,
                        entry.cohort.id()
                    );
                    if entry.cohort.coordinator().is_some() {
                        // External cohorts already answered for the old
                        // candidate; there is no renegotiation path.
                        entry
                            .cohort
                            .record_failure(PipelineError::CandidateInvalidated);
                        continue;
                    }
                    match prepare(tip, entry.cohort.modification()) {
                        Ok(candidate) => {
                            let candidate = Arc::new(candidate);
                            *tip = candidate.root_after().clone();
                            entry.cohort.set_candidate(candidate);
                        }
                        Err(e) => {
                            tracing::debug!(
                                "{}: failed to reprepare queued transaction {}: {}",
                                shard,
                                entry.cohort.id(),
                                e
                            );
                            entry.cohort.record_failure(PipelineError::Validation(e));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Inspect the head of the highest-precedence non-empty queue for
    /// expiry. `update_access` may supply a fresher access time (e.g.
    /// because the owning client was recently seen) before the verdict.
    pub fn check_for_expired(
        &mut self,
        update_access: impl FnOnce(&TransactionId) -> Option<u64>,
    ) {
        self.current_batch = 0;
        let timeout = self.config.transaction_commit_timeout_ticks;
        let now = self.now();

        enum Which {
            Finish,
            Commits,
            Transactions,
        }
        let which = if !self.pending_finish_commits.is_empty() {
            Which::Finish
        } else if !self.pending_commits.is_empty() {
            Which::Commits
        } else {
            Which::Transactions
        };

        let (id, state, mut delta) = {
            let queue = match which {
                Which::Finish => &self.pending_finish_commits,
                Which::Commits => &self.pending_commits,
                Which::Transactions => &self.pending_transactions,
            };
            let Some(entry) = queue.front() else { return };
            (
                entry.cohort.id().clone(),
                entry.cohort.state(),
                now.saturating_sub(entry.last_access),
            )
        };
        if delta < timeout {
            return;
        }

        if let Some(new_access) = update_access(&id) {
            let new_delta = now.saturating_sub(new_access);
            if new_delta < delta {
                tracing::debug!(
                    "{}: updated current transaction {} access time",
                    self.shard(),
                    id
                );
                let queue = match which {
                    Which::Finish => &mut self.pending_finish_commits,
                    Which::Commits => &mut self.pending_commits,
                    Which::Transactions => &mut self.pending_transactions,
                };
                queue.front_mut().unwrap().last_access = new_access;
                delta = new_delta;
            }
            if delta < timeout {
                return;
            }
        }

        tracing::warn!(
            "{}: current transaction {} has timed out after {} ticks in state {}",
            self.shard(),
            id,
            delta,
            state.name()
        );

        if state == CohortState::CommitPending {
            // Replication outcome must be awaited; only refresh the
            // access time.
            tracing::warn!(
                "{}: transaction {} is still committing, cannot abort",
                self.shard(),
                id
            );
            self.pending_finish_commits.front_mut().unwrap().last_access = now;
            return;
        }

        let failure = PipelineError::Timeout { state: state.name() };
        let mut entry = match which {
            Which::Finish => self.pending_finish_commits.pop_front().unwrap(),
            Which::Commits => self.pending_commits.pop_front().unwrap(),
            Which::Transactions => self.pending_transactions.pop_front().unwrap(),
        };

        if !state.is_terminal() {
            // A dropped prepared candidate invalidates everything built
            // on top of it, exactly like an abort would.
            if entry.cohort.candidate().is_some()
                && state == CohortState::PreCommitComplete
            {
                let mut tip = self.tree.root().clone();
                // Recompute the chain without the expired entry.
                let shard = self.config.shard_name.clone();
                for preceding in self.pending_finish_commits.iter() {
                    if let Some(candidate) = preceding.cohort.candidate() {
                        tip = candidate.root_after().clone();
                    }
                }
                Self::rebase_entries(&shard, &mut tip, self.pending_commits.iter_mut());
                Self::rebase_entries(&shard, &mut tip, self.pending_transactions.iter_mut());
                self.tip = tip;
            }
            if let Some(mut coordinator) = entry.cohort.take_coordinator() {
                tokio::spawn(async move { coordinator.abort().await });
            }
            entry.cohort.record_failure(failure.clone());
            let mut delivered = false;
            if let Some(callback) = entry.cohort.take_step_callback() {
                callback(Err(failure.clone()));
                delivered = true;
            }
            if let Some(callback) = entry.cohort.take_commit_callback() {
                callback(Err(failure.clone()));
                delivered = true;
            }
            if !delivered {
                self.unclaimed_failures
                    .insert(entry.cohort.id().clone(), failure);
            }
        } else if state == CohortState::Failed {
            // Keep a previously recorded failure claimable.
            if let Some(recorded) = entry.cohort.failure().cloned() {
                self.unclaimed_failures
                    .insert(entry.cohort.id().clone(), recorded);
            }
        }

        self.process_next_pending();
    }

    /// Surrender all queued transactions, e.g. on leadership loss. Every
    /// pending callback resolves with [`PipelineError::Shutdown`] and the
    /// tip resets to the committed root.
    pub fn get_and_clear_pending(&mut self) -> Vec<TransactionId> {
        let mut ids = Vec::new();
        let drained = self
            .pending_finish_commits
            .drain(..)
            .chain(self.pending_commits.drain(..))
            .chain(self.pending_transactions.drain(..));
        for mut entry in drained {
            ids.push(entry.cohort.id().clone());
            if let Some(mut coordinator) = entry.cohort.take_coordinator() {
                tokio::spawn(async move { coordinator.abort().await });
            }
            if let Some(callback) = entry.cohort.take_step_callback() {
                callback(Err(PipelineError::Shutdown));
            }
            if let Some(callback) = entry.cohort.take_commit_callback() {
                callback(Err(PipelineError::Shutdown));
            }
        }
        self.tip = self.tree.root().clone();
        self.replication_callbacks.clear();
        self.unclaimed_failures.clear();
        ids
    }

    /// Run `operation` once all three queues drain. Used to fence
    /// shutdown and snapshot barriers behind in-flight transactions.
    pub fn run_when_idle(&mut self, operation: Box<dyn FnOnce() + Send>) {
        self.run_when_idle = Some(operation);
        self.maybe_run_when_idle();
    }

    fn maybe_run_when_idle(&mut self) {
        if self.run_when_idle.is_none() {
            return;
        }
        if self.pending_transactions.is_empty()
            && self.pending_commits.is_empty()
            && self.pending_finish_commits.is_empty()
        {
            tracing::debug!(
                "{}: pending transactions complete, running idle operation",
                self.shard()
            );
            if let Some(operation) = self.run_when_idle.take() {
                operation();
            }
        }
    }
}
