//! The shard frontend: per-client session state and request dispatch.
//!
//! One `ShardFrontend` owns the commit pipeline plus all connected
//! client sessions, and is driven exclusively by its serialized owner
//! queue. Completion callbacks from the pipeline re-enter through the
//! same queue, looking their client up again by identity; a superseded
//! generation or retired transaction makes them no-ops.

use crate::error::SessionError;
use crate::frontend::{FrontendTransaction, ReadyStage, ReplayOutcome, TxPhase};
use crate::history::{DecidedOutcome, LocalHistory};
use crate::messages::{
    ConnectRequest, ConnectResponse, FinishProtocol, HistoryAction, HistoryRequest, Request,
    RequestEnvelope, ResponseBody, ResponseEnvelope, TransactionAction, TransactionRequest,
};
use canopy_cohort::CohortHandle;
use canopy_common::{
    ClientId, FrontendId, LocalHistoryId, RangeSet, Ticker, TransactionId, TreePath,
    STANDALONE_HISTORY,
};
use canopy_log::{Payload, ReplicationLog};
use canopy_shard::{
    CommitPipeline, MappedHost, PipelineError, SerialExecutor, ShardConfig,
};
use canopy_tree::{Candidate, Modification, Snapshot, Tree};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Protocol versions this backend speaks, ascending.
pub const SUPPORTED_VERSIONS: &[u32] = &[5, 6, 7];

struct ClientState {
    id: ClientId,
    #[allow(dead_code)]
    version: u32,
    expected_sequence: u64,
    histories: HashMap<u64, LocalHistory>,
    purged_histories: RangeSet,
    last_seen: u64,
}

/// The single-owner state of one shard's client-facing side.
pub struct ShardFrontend {
    pipeline: CommitPipeline,
    clients: HashMap<FrontendId, ClientState>,
    executor: SerialExecutor<ShardFrontend>,
    ticker: Arc<dyn Ticker>,
}

/// Submission handle to a running [`ShardFrontend`].
#[derive(Clone)]
pub struct FrontendHandle {
    executor: SerialExecutor<ShardFrontend>,
}

enum TxDecision {
    RespondUnrecorded(Result<ResponseBody, SessionError>),
    RespondRecorded(Result<ResponseBody, SessionError>),
    EnqueueReady {
        modification: Arc<Modification>,
        participants: Option<BTreeSet<String>>,
        simple: bool,
    },
    StartPreCommit,
    StartCommit,
    AbortQueued,
    AbortLocal { ack: ResponseBody },
    PurgeTx,
}

enum HistoryDecision {
    Respond(Result<ResponseBody, SessionError>),
    Replicate(Payload),
}

impl ShardFrontend {
    /// Start a shard frontend on its own owner task and return the
    /// submission handle.
    pub fn launch(config: ShardConfig, log: ReplicationLog, ticker: Arc<dyn Ticker>) -> FrontendHandle {
        let (executor, queue) = SerialExecutor::channel();
        let host = Arc::new(MappedHost::new(
            executor.clone(),
            |frontend: &mut ShardFrontend| &mut frontend.pipeline,
        ));
        let pipeline = CommitPipeline::new(config, Tree::new(), log.clone(), ticker.clone(), host);
        let frontend = ShardFrontend {
            pipeline,
            clients: HashMap::new(),
            executor: executor.clone(),
            ticker,
        };

        // Consensus pump: replication outcomes re-enter through the
        // owner queue before touching any state.
        let mut consensus = log.subscribe();
        let pump = executor.clone();
        tokio::spawn(async move {
            while let Some(replicated) = consensus.recv().await {
                if !pump.submit(move |frontend| frontend.pipeline.apply_replicated(replicated)) {
                    break;
                }
            }
        });

        let _owner = queue.run(frontend);
        FrontendHandle { executor }
    }

    fn shard_name(&self) -> &str {
        &self.pipeline.config().shard_name
    }

    /// Version negotiation plus generation arbitration.
    fn connect(&mut self, request: ConnectRequest) -> Result<ConnectResponse, SessionError> {
        let version = SUPPORTED_VERSIONS
            .iter()
            .rev()
            .find(|v| request.min_version <= **v && **v <= request.max_version)
            .copied()
            .ok_or(SessionError::UnsupportedVersion)?;

        enum Arbitration {
            Fresh,
            Reuse,
            Stale(u64),
            Supersede,
        }
        let arbitration = match self.clients.get(&request.frontend) {
            None => Arbitration::Fresh,
            Some(state) => match request.generation.cmp(&state.id.generation()) {
                Ordering::Less => Arbitration::Stale(state.id.generation()),
                Ordering::Equal => Arbitration::Reuse,
                Ordering::Greater => Arbitration::Supersede,
            },
        };

        let now = self.ticker.read();
        match arbitration {
            Arbitration::Stale(current) => {
                tracing::warn!(
                    "{}: rejecting connect of {} at stale generation {}",
                    self.shard_name(),
                    request.frontend,
                    request.generation
                );
                Err(SessionError::StaleGeneration {
                    current,
                    actual: request.generation,
                })
            }
            Arbitration::Reuse => {
                let shard_name = self.shard_name().to_string();
                let state = self.clients.get_mut(&request.frontend).unwrap();
                state.last_seen = now;
                state.version = version;
                tracing::debug!(
                    "{}: reusing session state for {}",
                    shard_name,
                    state.id
                );
                Ok(ConnectResponse { version })
            }
            Arbitration::Supersede => {
                let old = self.clients.remove(&request.frontend).unwrap();
                self.retire_client(old);
                self.create_session(request.frontend, request.generation, version, now);
                Ok(ConnectResponse { version })
            }
            Arbitration::Fresh => {
                self.create_session(request.frontend, request.generation, version, now);
                Ok(ConnectResponse { version })
            }
        }
    }

    fn create_session(&mut self, frontend: FrontendId, generation: u64, version: u32, now: u64) {
        let client = ClientId::new(frontend.clone(), generation);
        tracing::info!("{}: creating session state for {}", self.shard_name(), client);
        let mut histories = HashMap::new();
        histories.insert(
            STANDALONE_HISTORY,
            LocalHistory::new(LocalHistoryId::standalone(client.clone())),
        );
        self.clients.insert(
            frontend,
            ClientState {
                id: client,
                version,
                expected_sequence: 0,
                histories,
                purged_histories: RangeSet::new(),
                last_seen: now,
            },
        );
    }

    /// Retire everything a superseded generation owned. Queued pipeline
    /// entries are aborted; in-flight callbacks become no-ops because
    /// their generation lookup fails from here on.
    fn retire_client(&mut self, mut state: ClientState) {
        tracing::info!("{}: retiring client state for {}", self.shard_name(), state.id);
        let mut queued = Vec::new();
        for history in state.histories.values_mut() {
            for transaction in history.transactions.values_mut() {
                if matches!(transaction.phase, TxPhase::Ready { .. }) {
                    queued.push(transaction.id().clone());
                }
                transaction.retire();
            }
        }
        for id in queued {
            self.pipeline.start_abort(&id, None);
        }
    }

    fn handle_envelope(&mut self, envelope: RequestEnvelope) {
        let started = self.ticker.read();
        let RequestEnvelope {
            sequence,
            request,
            reply,
        } = envelope;
        let client = request.client().clone();

        enum Gate {
            NoSession,
            Stale(u64),
            OutOfOrder(u64),
            Replay,
            Dispatch,
        }
        let gate = match self.clients.get_mut(client.frontend()) {
            None => Gate::NoSession,
            Some(state) if state.id.generation() != client.generation() => {
                Gate::Stale(state.id.generation())
            }
            Some(state) => {
                state.last_seen = started;
                match sequence.cmp(&state.expected_sequence) {
                    Ordering::Greater => Gate::OutOfOrder(state.expected_sequence),
                    Ordering::Less => Gate::Replay,
                    Ordering::Equal => {
                        state.expected_sequence += 1;
                        Gate::Dispatch
                    }
                }
            }
        };

        match gate {
            Gate::NoSession => {
                self.send_unrecorded(reply, sequence, started, Err(SessionError::NoSession))
            }
            Gate::Stale(current) => self.send_unrecorded(
                reply,
                sequence,
                started,
                Err(SessionError::StaleGeneration {
                    current,
                    actual: client.generation(),
                }),
            ),
            Gate::OutOfOrder(expected) => self.send_unrecorded(
                reply,
                sequence,
                started,
                Err(SessionError::OutOfOrder {
                    expected,
                    actual: sequence,
                }),
            ),
            Gate::Replay => self.replay_envelope(client, sequence, request, reply, started),
            Gate::Dispatch => match request {
                Request::Transaction(request) => {
                    self.dispatch_transaction(client, sequence, request, reply, started)
                }
                Request::History(request) => {
                    self.dispatch_history(client, sequence, request, reply, started)
                }
            },
        }
    }

    /// Answer a repeated request without re-executing side effects.
    fn replay_envelope(
        &mut self,
        client: ClientId,
        sequence: u64,
        request: Request,
        reply: oneshot::Sender<ResponseEnvelope>,
        started: u64,
    ) {
        match request {
            Request::Transaction(request) => {
                let state = self.clients.get(client.frontend()).expect("session checked");
                let history_number = request.id.history().history();
                let transaction_number = request.id.transaction();
                let outcome = match state.histories.get(&history_number) {
                    None => Some(Err(SessionError::DeadHistory(request.id.history().clone()))),
                    Some(history) if history.is_purged(transaction_number) => {
                        Some(Err(SessionError::DeadTransaction(request.id.clone())))
                    }
                    Some(history) => match history.transactions.get(&transaction_number) {
                        Some(transaction) => match transaction.replay(sequence) {
                            ReplayOutcome::Recorded(envelope) => {
                                tracing::debug!(
                                    "{}: replaying response for sequence {}",
                                    self.shard_name(),
                                    sequence
                                );
                                let _ = reply.send(envelope);
                                return;
                            }
                            ReplayOutcome::Purged => {
                                Some(Err(SessionError::DeadSequence(sequence)))
                            }
                            ReplayOutcome::InFlight => None,
                        },
                        None => match history.outcome_of(transaction_number) {
                            Some(DecidedOutcome::Committed) => {
                                Some(Err(SessionError::AlreadyCommitted(request.id.clone())))
                            }
                            Some(DecidedOutcome::Aborted) => {
                                Some(Err(SessionError::AlreadyAborted(request.id.clone())))
                            }
                            None => Some(Err(SessionError::DeadTransaction(request.id.clone()))),
                        },
                    },
                };
                match outcome {
                    Some(result) => self.send_unrecorded(reply, sequence, started, result),
                    None => {
                        // The original reply is still being produced;
                        // the client will retry once more.
                        tracing::debug!(
                            "{}: reply for sequence {} still in flight",
                            self.shard_name(),
                            sequence
                        );
                    }
                }
            }
            Request::History(request) => {
                let state = self.clients.get(client.frontend()).expect("session checked");
                let history_number = request.id.history();
                let settled = match request.action {
                    HistoryAction::Create => state.histories.contains_key(&history_number),
                    HistoryAction::Close => state
                        .histories
                        .get(&history_number)
                        .map(LocalHistory::is_closed)
                        .unwrap_or(false),
                    HistoryAction::Purge => state.purged_histories.contains(history_number),
                };
                let result = if settled {
                    Ok(ResponseBody::HistoryAck)
                } else {
                    Err(SessionError::DeadSequence(sequence))
                };
                self.send_unrecorded(reply, sequence, started, result);
            }
        }
    }

    fn dispatch_history(
        &mut self,
        client: ClientId,
        sequence: u64,
        request: HistoryRequest,
        reply: oneshot::Sender<ResponseEnvelope>,
        started: u64,
    ) {
        let history_number = request.id.history();
        if history_number == STANDALONE_HISTORY {
            self.send_unrecorded(
                reply,
                sequence,
                started,
                Err(SessionError::UnexpectedRequest {
                    state: "the standalone history",
                }),
            );
            return;
        }

        let decision = {
            let state = self.clients.get(client.frontend()).expect("session checked");
            match request.action {
                HistoryAction::Create => {
                    if state.purged_histories.contains(history_number) {
                        HistoryDecision::Respond(Err(SessionError::DeadHistory(
                            request.id.clone(),
                        )))
                    } else if state.histories.contains_key(&history_number) {
                        HistoryDecision::Respond(Ok(ResponseBody::HistoryAck))
                    } else {
                        HistoryDecision::Replicate(Payload::CreateHistory {
                            id: request.id.clone(),
                        })
                    }
                }
                HistoryAction::Close => match state.histories.get(&history_number) {
                    None => {
                        HistoryDecision::Respond(Err(SessionError::DeadHistory(request.id.clone())))
                    }
                    Some(history) if history.is_closed() => {
                        HistoryDecision::Respond(Ok(ResponseBody::HistoryAck))
                    }
                    Some(_) => HistoryDecision::Replicate(Payload::CloseHistory {
                        id: request.id.clone(),
                    }),
                },
                HistoryAction::Purge => {
                    if state.purged_histories.contains(history_number) {
                        HistoryDecision::Respond(Ok(ResponseBody::HistoryAck))
                    } else if !state.histories.contains_key(&history_number) {
                        HistoryDecision::Respond(Err(SessionError::DeadHistory(
                            request.id.clone(),
                        )))
                    } else {
                        HistoryDecision::Replicate(Payload::PurgeHistory {
                            id: request.id.clone(),
                        })
                    }
                }
            }
        };

        match decision {
            HistoryDecision::Respond(result) => {
                self.send_unrecorded(reply, sequence, started, result)
            }
            HistoryDecision::Replicate(payload) => {
                // The decision itself must be durable before it takes
                // effect, so it survives leadership change.
                let executor = self.executor.clone();
                let id = request.id.clone();
                let action = request.action;
                let outcome = self.pipeline.replicate(
                    payload,
                    Box::new(move || {
                        executor.submit(move |frontend| {
                            frontend.finish_history(client, id, action, sequence, started, reply)
                        });
                    }),
                );
                if let Err(e) = outcome {
                    tracing::error!(
                        "{}: failed to replicate history decision: {}",
                        self.shard_name(),
                        e
                    );
                }
            }
        }
    }

    /// Consensus reached on a history decision; apply and answer.
    fn finish_history(
        &mut self,
        client: ClientId,
        id: LocalHistoryId,
        action: HistoryAction,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
    ) {
        let history_number = id.history();
        let mut queued = Vec::new();
        {
            let Some(state) = self.clients.get_mut(client.frontend()) else {
                return;
            };
            if state.id.generation() != client.generation() {
                return;
            }
            match action {
                HistoryAction::Create => {
                    state
                        .histories
                        .entry(history_number)
                        .or_insert_with(|| LocalHistory::new(id.clone()));
                }
                HistoryAction::Close => {
                    if let Some(history) = state.histories.get_mut(&history_number) {
                        history.close();
                    }
                }
                HistoryAction::Purge => {
                    if let Some(mut history) = state.histories.remove(&history_number) {
                        for transaction in history.transactions.values_mut() {
                            if matches!(transaction.phase, TxPhase::Ready { .. }) {
                                queued.push(transaction.id().clone());
                            }
                        }
                        history.retire();
                    }
                    state.purged_histories.insert(history_number);
                }
            }
        }
        for id in queued {
            self.pipeline.start_abort(&id, None);
        }
        self.send_unrecorded(reply, sequence, started, Ok(ResponseBody::HistoryAck));
    }

    fn dispatch_transaction(
        &mut self,
        client: ClientId,
        sequence: u64,
        request: TransactionRequest,
        reply: oneshot::Sender<ResponseEnvelope>,
        started: u64,
    ) {
        let TransactionRequest { id: tx_id, action } = request;
        let history_number = tx_id.history().history();
        let transaction_number = tx_id.transaction();

        let decision = 'decide: {
            let state = self
                .clients
                .get_mut(client.frontend())
                .expect("session checked");
            let Some(history) = state.histories.get_mut(&history_number) else {
                break 'decide TxDecision::RespondUnrecorded(Err(SessionError::DeadHistory(
                    tx_id.history().clone(),
                )));
            };
            if history.is_purged(transaction_number) {
                break 'decide TxDecision::RespondUnrecorded(Err(SessionError::DeadTransaction(
                    tx_id.clone(),
                )));
            }

            if !history.transactions.contains_key(&transaction_number) {
                match history.outcome_of(transaction_number) {
                    Some(DecidedOutcome::Committed) => {
                        if matches!(action, TransactionAction::Purge) {
                            break 'decide TxDecision::PurgeTx;
                        }
                        break 'decide TxDecision::RespondUnrecorded(Err(
                            SessionError::AlreadyCommitted(tx_id.clone()),
                        ));
                    }
                    Some(DecidedOutcome::Aborted) => {
                        if matches!(action, TransactionAction::Purge) {
                            break 'decide TxDecision::PurgeTx;
                        }
                        break 'decide TxDecision::RespondUnrecorded(Err(
                            SessionError::AlreadyAborted(tx_id.clone()),
                        ));
                    }
                    None => {
                        let creates = matches!(
                            action,
                            TransactionAction::Modify { .. }
                                | TransactionAction::Read { .. }
                                | TransactionAction::Exists { .. }
                        );
                        if !creates {
                            break 'decide TxDecision::RespondUnrecorded(Err(
                                SessionError::DeadTransaction(tx_id.clone()),
                            ));
                        }
                        if history.is_closed() {
                            break 'decide TxDecision::RespondUnrecorded(Err(
                                SessionError::ClosedHistory(tx_id.history().clone()),
                            ));
                        }
                        let snapshot = self.pipeline.tree().snapshot();
                        history.transactions.insert(
                            transaction_number,
                            FrontendTransaction::new_open(tx_id.clone(), snapshot),
                        );
                    }
                }
            }

            let transaction = history.transactions.get_mut(&transaction_number).unwrap();
            Self::decide_transaction(transaction, action, &tx_id)
        };

        self.apply_transaction_decision(client, tx_id, sequence, started, reply, decision);
    }

    /// Phase gating: what does `action` mean for a transaction in its
    /// current phase?
    fn decide_transaction(
        transaction: &mut FrontendTransaction,
        action: TransactionAction,
        tx_id: &TransactionId,
    ) -> TxDecision {
        match action {
            TransactionAction::Read { path } => match &transaction.phase {
                TxPhase::Open { snapshot, .. } => TxDecision::RespondRecorded(Ok(
                    ResponseBody::ReadData {
                        data: snapshot.read(&path),
                    },
                )),
                TxPhase::Failed(e) => TxDecision::RespondRecorded(Err(e.clone())),
                other => TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest {
                    state: other.name(),
                })),
            },
            TransactionAction::Exists { path } => match &transaction.phase {
                TxPhase::Open { snapshot, .. } => TxDecision::RespondRecorded(Ok(
                    ResponseBody::ExistsData {
                        present: snapshot.exists(&path),
                    },
                )),
                TxPhase::Failed(e) => TxDecision::RespondRecorded(Err(e.clone())),
                other => TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest {
                    state: other.name(),
                })),
            },
            TransactionAction::Modify {
                ops,
                protocol,
                participating_shards,
            } => {
                enum ModPhase {
                    Open,
                    SealedReady,
                    Failed(SessionError),
                    Committed,
                    Aborted,
                    Other(&'static str),
                }
                let classification = match &transaction.phase {
                    TxPhase::Open { .. } => ModPhase::Open,
                    TxPhase::Sealed { .. }
                        if ops.is_empty()
                            && matches!(
                                protocol,
                                Some(FinishProtocol::Simple | FinishProtocol::ThreePhase)
                            ) =>
                    {
                        ModPhase::SealedReady
                    }
                    TxPhase::Failed(e) => ModPhase::Failed(e.clone()),
                    TxPhase::Committed => ModPhase::Committed,
                    TxPhase::Aborted => ModPhase::Aborted,
                    other => ModPhase::Other(other.name()),
                };

                match classification {
                    ModPhase::Open => {
                        if let TxPhase::Open { modification, .. } = &mut transaction.phase {
                            modification.extend(ops);
                        }
                        match protocol {
                            None => TxDecision::RespondRecorded(Ok(ResponseBody::ModifyAck)),
                            Some(FinishProtocol::Abort) => {
                                transaction.phase = TxPhase::Aborting;
                                TxDecision::AbortLocal {
                                    ack: ResponseBody::ModifyAck,
                                }
                            }
                            Some(FinishProtocol::Ready) => {
                                let old = std::mem::replace(
                                    &mut transaction.phase,
                                    TxPhase::Aborting,
                                );
                                let TxPhase::Open { modification, .. } = old else {
                                    unreachable!()
                                };
                                transaction.phase = TxPhase::Sealed {
                                    modification: Arc::new(modification),
                                    participating_shards,
                                };
                                TxDecision::RespondRecorded(Ok(ResponseBody::ModifyAck))
                            }
                            Some(finish @ (FinishProtocol::Simple | FinishProtocol::ThreePhase)) => {
                                let old = std::mem::replace(
                                    &mut transaction.phase,
                                    TxPhase::Ready {
                                        stage: ReadyStage::CanCommitPending,
                                    },
                                );
                                let TxPhase::Open { modification, .. } = old else {
                                    unreachable!()
                                };
                                TxDecision::EnqueueReady {
                                    modification: Arc::new(modification),
                                    participants: participating_shards,
                                    simple: finish == FinishProtocol::Simple,
                                }
                            }
                        }
                    }
                    ModPhase::SealedReady => {
                        let old = std::mem::replace(
                            &mut transaction.phase,
                            TxPhase::Ready {
                                stage: ReadyStage::CanCommitPending,
                            },
                        );
                        let TxPhase::Sealed {
                            modification,
                            participating_shards: sealed_participants,
                        } = old
                        else {
                            unreachable!()
                        };
                        TxDecision::EnqueueReady {
                            modification,
                            participants: sealed_participants,
                            simple: matches!(protocol, Some(FinishProtocol::Simple)),
                        }
                    }
                    ModPhase::Failed(e) => TxDecision::RespondRecorded(Err(e)),
                    ModPhase::Committed => TxDecision::RespondRecorded(Err(
                        SessionError::AlreadyCommitted(tx_id.clone()),
                    )),
                    ModPhase::Aborted => TxDecision::RespondRecorded(Err(
                        SessionError::AlreadyAborted(tx_id.clone()),
                    )),
                    ModPhase::Other(state) => {
                        TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest { state }))
                    }
                }
            }
            TransactionAction::PreCommit => match &mut transaction.phase {
                TxPhase::Ready { stage } if *stage == ReadyStage::CanCommitComplete => {
                    *stage = ReadyStage::PreCommitPending;
                    TxDecision::StartPreCommit
                }
                TxPhase::Failed(e) => TxDecision::RespondRecorded(Err(e.clone())),
                other => TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest {
                    state: other.name(),
                })),
            },
            TransactionAction::DoCommit => match &mut transaction.phase {
                TxPhase::Ready { stage } if *stage == ReadyStage::PreCommitComplete => {
                    *stage = ReadyStage::CommitPending;
                    TxDecision::StartCommit
                }
                TxPhase::Failed(e) => TxDecision::RespondRecorded(Err(e.clone())),
                other => TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest {
                    state: other.name(),
                })),
            },
            TransactionAction::Abort => {
                enum AbortPhase {
                    Local,
                    Queued,
                    Committed,
                    Aborted,
                    Other(&'static str),
                }
                let classification = match &transaction.phase {
                    TxPhase::Open { .. } | TxPhase::Sealed { .. } | TxPhase::Failed(_) => {
                        AbortPhase::Local
                    }
                    TxPhase::Ready { .. } => AbortPhase::Queued,
                    TxPhase::Committed => AbortPhase::Committed,
                    TxPhase::Aborted => AbortPhase::Aborted,
                    other => AbortPhase::Other(other.name()),
                };
                match classification {
                    AbortPhase::Local => {
                        transaction.phase = TxPhase::Aborting;
                        TxDecision::AbortLocal {
                            ack: ResponseBody::AbortAck,
                        }
                    }
                    AbortPhase::Queued => TxDecision::AbortQueued,
                    AbortPhase::Committed => TxDecision::RespondRecorded(Err(
                        SessionError::AlreadyCommitted(tx_id.clone()),
                    )),
                    AbortPhase::Aborted => TxDecision::RespondRecorded(Err(
                        SessionError::AlreadyAborted(tx_id.clone()),
                    )),
                    AbortPhase::Other(state) => {
                        TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest { state }))
                    }
                }
            }
            TransactionAction::Purge => match &transaction.phase {
                TxPhase::Committed | TxPhase::Aborted | TxPhase::Failed(_) => TxDecision::PurgeTx,
                other => TxDecision::RespondRecorded(Err(SessionError::UnexpectedRequest {
                    state: other.name(),
                })),
            },
        }
    }

    fn apply_transaction_decision(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        decision: TxDecision,
    ) {
        match decision {
            TxDecision::RespondUnrecorded(result) => {
                self.send_unrecorded(reply, sequence, started, result)
            }
            TxDecision::RespondRecorded(result) => {
                self.respond_recorded(&client, &tx_id, sequence, started, reply, result)
            }
            TxDecision::EnqueueReady {
                modification,
                participants,
                simple,
            } => {
                self.pipeline
                    .enqueue_ready_transaction(tx_id.clone(), modification, participants);
                let executor = self.executor.clone();
                let callback_client = client;
                let callback_tx = tx_id.clone();
                self.pipeline.start_can_commit(
                    &tx_id,
                    Box::new(move |result| {
                        executor.submit(move |frontend| {
                            frontend.complete_can_commit(
                                callback_client,
                                callback_tx,
                                sequence,
                                started,
                                reply,
                                result,
                                simple,
                            )
                        });
                    }),
                );
            }
            TxDecision::StartPreCommit => {
                let executor = self.executor.clone();
                let callback_client = client;
                let callback_tx = tx_id.clone();
                self.pipeline.start_pre_commit(
                    &tx_id,
                    Box::new(move |result| {
                        executor.submit(move |frontend| {
                            frontend.complete_pre_commit(
                                callback_client,
                                callback_tx,
                                sequence,
                                started,
                                reply,
                                result,
                                false,
                            )
                        });
                    }),
                );
            }
            TxDecision::StartCommit => {
                let executor = self.executor.clone();
                let callback_client = client;
                let callback_tx = tx_id.clone();
                self.pipeline.start_commit(
                    &tx_id,
                    Box::new(move |result| {
                        executor.submit(move |frontend| {
                            frontend.complete_commit(
                                callback_client,
                                callback_tx,
                                sequence,
                                started,
                                reply,
                                result,
                            )
                        });
                    }),
                );
            }
            TxDecision::AbortQueued => {
                let executor = self.executor.clone();
                let callback_client = client;
                let callback_tx = tx_id.clone();
                self.pipeline.start_abort(
                    &tx_id,
                    Some(Box::new(move |result| {
                        executor.submit(move |frontend| {
                            frontend.complete_queued_abort(
                                callback_client,
                                callback_tx,
                                sequence,
                                started,
                                reply,
                                result,
                            )
                        });
                    })),
                );
            }
            TxDecision::AbortLocal { ack } => {
                self.start_durable_abort(client, tx_id, sequence, started, reply, ack)
            }
            TxDecision::PurgeTx => {
                let executor = self.executor.clone();
                let callback_client = client;
                let callback_tx = tx_id.clone();
                let outcome = self.pipeline.replicate(
                    Payload::PurgeTransaction { id: tx_id },
                    Box::new(move || {
                        executor.submit(move |frontend| {
                            frontend.finish_purge(
                                callback_client,
                                callback_tx,
                                sequence,
                                started,
                                reply,
                            )
                        });
                    }),
                );
                if let Err(e) = outcome {
                    tracing::error!(
                        "{}: failed to replicate transaction purge: {}",
                        self.shard_name(),
                        e
                    );
                }
            }
        }
    }

    fn complete_can_commit(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        result: Result<(), PipelineError>,
        simple: bool,
    ) {
        match result {
            Err(e) => self.fail_transaction(client, tx_id, sequence, started, reply, e),
            Ok(()) => {
                if !self.set_ready_stage(&client, &tx_id, ReadyStage::CanCommitComplete) {
                    return;
                }
                if simple {
                    self.set_ready_stage(&client, &tx_id, ReadyStage::PreCommitPending);
                    let executor = self.executor.clone();
                    let callback_tx = tx_id.clone();
                    self.pipeline.start_pre_commit(
                        &tx_id,
                        Box::new(move |result| {
                            executor.submit(move |frontend| {
                                frontend.complete_pre_commit(
                                    client,
                                    callback_tx,
                                    sequence,
                                    started,
                                    reply,
                                    result,
                                    true,
                                )
                            });
                        }),
                    );
                } else {
                    self.respond_recorded(
                        &client,
                        &tx_id,
                        sequence,
                        started,
                        reply,
                        Ok(ResponseBody::CanCommitAck),
                    );
                }
            }
        }
    }

    fn complete_pre_commit(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        result: Result<(), PipelineError>,
        simple: bool,
    ) {
        match result {
            Err(e) => self.fail_transaction(client, tx_id, sequence, started, reply, e),
            Ok(()) => {
                if !self.set_ready_stage(&client, &tx_id, ReadyStage::PreCommitComplete) {
                    return;
                }
                if simple {
                    self.set_ready_stage(&client, &tx_id, ReadyStage::CommitPending);
                    let executor = self.executor.clone();
                    let callback_tx = tx_id.clone();
                    self.pipeline.start_commit(
                        &tx_id,
                        Box::new(move |result| {
                            executor.submit(move |frontend| {
                                frontend.complete_commit(
                                    client,
                                    callback_tx,
                                    sequence,
                                    started,
                                    reply,
                                    result,
                                )
                            });
                        }),
                    );
                } else {
                    self.respond_recorded(
                        &client,
                        &tx_id,
                        sequence,
                        started,
                        reply,
                        Ok(ResponseBody::PreCommitAck),
                    );
                }
            }
        }
    }

    fn complete_commit(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        result: Result<u64, PipelineError>,
    ) {
        match result {
            Err(e) => self.fail_transaction(client, tx_id, sequence, started, reply, e),
            Ok(log_index) => {
                if !self.finalize_committed(&client, &tx_id) {
                    return;
                }
                self.respond_recorded(
                    &client,
                    &tx_id,
                    sequence,
                    started,
                    reply,
                    Ok(ResponseBody::CommitAck { log_index }),
                );
            }
        }
    }

    fn complete_queued_abort(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        result: Result<(), PipelineError>,
    ) {
        match result {
            Ok(()) => {
                if self.transaction_mut(&client, &tx_id).is_none() {
                    return;
                }
                self.start_durable_abort(
                    client,
                    tx_id,
                    sequence,
                    started,
                    reply,
                    ResponseBody::AbortAck,
                );
            }
            Err(e) => {
                // Typically COMMIT_PENDING: the transaction is already
                // submitted and only the replication outcome decides.
                self.respond_recorded(
                    &client,
                    &tx_id,
                    sequence,
                    started,
                    reply,
                    Err(SessionError::Pipeline(e)),
                );
            }
        }
    }

    /// Replicate the abort decision itself before answering.
    fn start_durable_abort(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        ack: ResponseBody,
    ) {
        if let Some(transaction) = self.transaction_mut(&client, &tx_id) {
            transaction.phase = TxPhase::Aborting;
        }
        let executor = self.executor.clone();
        let callback_tx = tx_id.clone();
        let outcome = self.pipeline.replicate(
            Payload::AbortTransaction { id: tx_id },
            Box::new(move || {
                executor.submit(move |frontend| {
                    frontend.finish_durable_abort(
                        client,
                        callback_tx,
                        sequence,
                        started,
                        reply,
                        ack,
                    )
                });
            }),
        );
        if let Err(e) = outcome {
            tracing::error!(
                "{}: failed to replicate transaction abort: {}",
                self.shard_name(),
                e
            );
        }
    }

    fn finish_durable_abort(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        ack: ResponseBody,
    ) {
        let recorded = {
            let Some(state) = self.clients.get_mut(client.frontend()) else {
                return;
            };
            if state.id.generation() != client.generation() {
                return;
            }
            match state.histories.get_mut(&tx_id.history().history()) {
                None => false,
                Some(history) => {
                    let live = match history.transactions.get_mut(&tx_id.transaction()) {
                        Some(transaction)
                            if !matches!(transaction.phase, TxPhase::Retired) =>
                        {
                            transaction.phase = TxPhase::Aborted;
                            true
                        }
                        _ => false,
                    };
                    if live {
                        history.record_aborted(tx_id.transaction());
                    }
                    live
                }
            }
        };
        if recorded {
            self.respond_recorded(&client, &tx_id, sequence, started, reply, Ok(ack));
        }
    }

    fn finish_purge(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
    ) {
        {
            let Some(state) = self.clients.get_mut(client.frontend()) else {
                return;
            };
            if state.id.generation() != client.generation() {
                return;
            }
            if let Some(history) = state.histories.get_mut(&tx_id.history().history()) {
                history.record_purged(tx_id.transaction());
            }
        }
        tracing::debug!("{}: purged transaction {}", self.shard_name(), tx_id);
        self.send_unrecorded(reply, sequence, started, Ok(ResponseBody::PurgeAck));
    }

    fn fail_transaction(
        &mut self,
        client: ClientId,
        tx_id: TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        failure: PipelineError,
    ) {
        let error = SessionError::Pipeline(failure);
        let live = match self.transaction_mut(&client, &tx_id) {
            None => false,
            Some(transaction) => {
                if matches!(transaction.phase, TxPhase::Retired) {
                    false
                } else {
                    transaction.phase = TxPhase::Failed(error.clone());
                    true
                }
            }
        };
        if live {
            self.respond_recorded(&client, &tx_id, sequence, started, reply, Err(error));
        }
    }

    fn finalize_committed(&mut self, client: &ClientId, tx_id: &TransactionId) -> bool {
        let Some(state) = self.clients.get_mut(client.frontend()) else {
            return false;
        };
        if state.id.generation() != client.generation() {
            return false;
        }
        let Some(history) = state.histories.get_mut(&tx_id.history().history()) else {
            return false;
        };
        let live = match history.transactions.get_mut(&tx_id.transaction()) {
            Some(transaction) if !matches!(transaction.phase, TxPhase::Retired) => {
                transaction.phase = TxPhase::Committed;
                true
            }
            _ => false,
        };
        if live {
            history.record_committed(tx_id.transaction());
        }
        live
    }

    fn set_ready_stage(
        &mut self,
        client: &ClientId,
        tx_id: &TransactionId,
        stage: ReadyStage,
    ) -> bool {
        match self.transaction_mut(client, tx_id) {
            Some(transaction) => match &mut transaction.phase {
                TxPhase::Ready { stage: current } => {
                    *current = stage;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    fn transaction_mut(
        &mut self,
        client: &ClientId,
        tx_id: &TransactionId,
    ) -> Option<&mut FrontendTransaction> {
        let state = self.clients.get_mut(client.frontend())?;
        if state.id.generation() != client.generation() {
            return None;
        }
        state
            .histories
            .get_mut(&tx_id.history().history())?
            .transactions
            .get_mut(&tx_id.transaction())
    }

    fn send_unrecorded(
        &self,
        reply: oneshot::Sender<ResponseEnvelope>,
        sequence: u64,
        started: u64,
        result: Result<ResponseBody, SessionError>,
    ) {
        let envelope = ResponseEnvelope {
            sequence,
            result,
            execution_ticks: self.ticker.read().saturating_sub(started),
        };
        let _ = reply.send(envelope);
    }

    /// Record the response in the transaction's replay window, then send
    /// it.
    fn respond_recorded(
        &mut self,
        client: &ClientId,
        tx_id: &TransactionId,
        sequence: u64,
        started: u64,
        reply: oneshot::Sender<ResponseEnvelope>,
        result: Result<ResponseBody, SessionError>,
    ) {
        let envelope = ResponseEnvelope {
            sequence,
            result,
            execution_ticks: self.ticker.read().saturating_sub(started),
        };
        let window = self.pipeline.config().replay_window;
        if let Some(transaction) = self.transaction_mut(client, tx_id) {
            if !matches!(transaction.phase, TxPhase::Retired) {
                transaction.record_response(&envelope, window);
            }
        }
        let _ = reply.send(envelope);
    }

    /// Drop all leader-side state: every client session is retired and
    /// the pipeline surrenders its queued transactions. Any still
    /// in-flight callbacks become no-ops.
    fn leadership_lost(&mut self) {
        tracing::info!("{}: purging leader state", self.shard_name());
        for (_, mut state) in self.clients.drain() {
            for history in state.histories.values_mut() {
                history.retire();
            }
        }
        let surrendered = self.pipeline.get_and_clear_pending();
        if !surrendered.is_empty() {
            tracing::warn!(
                "{}: surrendered {} pending transactions",
                self.shard_name(),
                surrendered.len()
            );
        }
    }

    /// Expiry sweep with client liveness as the access-time hint.
    fn check_expired(&mut self) {
        let liveness: HashMap<FrontendId, (u64, u64)> = self
            .clients
            .iter()
            .map(|(frontend, state)| {
                (frontend.clone(), (state.id.generation(), state.last_seen))
            })
            .collect();
        self.pipeline.check_for_expired(move |tx_id| {
            let client = tx_id.history().client();
            liveness
                .get(client.frontend())
                .and_then(|(generation, last_seen)| {
                    (*generation == client.generation()).then_some(*last_seen)
                })
        });
    }
}

impl FrontendHandle {
    async fn with<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut ShardFrontend) -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if !self.executor.submit(move |frontend| {
            let _ = tx.send(f(frontend));
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Establish or refresh a session.
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, SessionError> {
        self.with(move |frontend| frontend.connect(request))
            .await
            .unwrap_or(Err(SessionError::NoSession))
    }

    /// Submit a request envelope. Returns false if the frontend stopped.
    pub fn submit(&self, envelope: RequestEnvelope) -> bool {
        self.executor
            .submit(move |frontend| frontend.handle_envelope(envelope))
    }

    /// Submit a request and await its response. `None` means no response
    /// was produced (reply in flight on a replayed sequence, or the
    /// frontend stopped).
    pub async fn request(&self, sequence: u64, request: Request) -> Option<ResponseEnvelope> {
        let (reply, rx) = oneshot::channel();
        if !self.submit(RequestEnvelope {
            sequence,
            request,
            reply,
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Run one expiry sweep.
    pub async fn check_expired(&self) {
        self.with(|frontend| frontend.check_expired()).await;
    }

    /// Tear down all leader-side session and pipeline state.
    pub async fn leadership_lost(&self) {
        self.with(|frontend| frontend.leadership_lost()).await;
    }

    /// Register an external cohort at a tree path.
    pub async fn register_cohort(&self, path: TreePath, handle: CohortHandle) {
        self.with(move |frontend| {
            frontend.pipeline.registry_mut().register(&path, handle);
        })
        .await;
    }

    /// Subscribe to committed candidates.
    pub async fn register_listener(&self) -> Option<mpsc::UnboundedReceiver<Arc<Candidate>>> {
        self.with(|frontend| frontend.pipeline.register_listener())
            .await
    }

    /// A read-only snapshot of the committed tree.
    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.with(|frontend| frontend.pipeline.tree().snapshot())
            .await
    }
}
