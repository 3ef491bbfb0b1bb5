//! Session-boundary integration tests: sequencing, replay, generation
//! arbitration, histories and the full commit flows.

use canopy_common::{
    ClientId, FrontendId, LocalHistoryId, ManualTicker, Ticker, TransactionId, TreePath,
};
use canopy_log::ReplicationLog;
use canopy_session::{
    ConnectRequest, FinishProtocol, FrontendHandle, HistoryAction, HistoryRequest, Request,
    RequestEnvelope, ResponseBody, SessionError, ShardFrontend, TransactionAction,
    TransactionRequest, SUPPORTED_VERSIONS,
};
use canopy_shard::{PipelineError, ShardConfig};
use canopy_tree::{ModOp, Node, Value};
use std::sync::Arc;
use tokio::sync::oneshot;

const TIMEOUT_TICKS: u64 = 1_000;

struct Harness {
    handle: FrontendHandle,
    log: ReplicationLog,
    ticker: Arc<ManualTicker>,
}

fn launch() -> Harness {
    launch_with(|_config| {})
}

fn launch_with(tune: impl FnOnce(&mut ShardConfig)) -> Harness {
    let ticker = Arc::new(ManualTicker::new());
    let log = ReplicationLog::new();
    let mut config = ShardConfig {
        transaction_commit_timeout_ticks: TIMEOUT_TICKS,
        ..ShardConfig::default()
    };
    tune(&mut config);
    let ticker_dyn: Arc<dyn Ticker> = ticker.clone();
    let handle = ShardFrontend::launch(config, log.clone(), ticker_dyn);
    Harness {
        handle,
        log,
        ticker,
    }
}

fn frontend() -> FrontendId {
    FrontendId::new("member-1")
}

fn client(generation: u64) -> ClientId {
    ClientId::new(frontend(), generation)
}

fn standalone_tx(generation: u64, n: u64) -> TransactionId {
    TransactionId::new(LocalHistoryId::standalone(client(generation)), n)
}

fn chained_tx(generation: u64, history: u64, n: u64) -> TransactionId {
    TransactionId::new(LocalHistoryId::new(client(generation), history), n)
}

fn merge_op(path: &str, value: i64) -> ModOp {
    ModOp::Merge {
        path: TreePath::parse(path),
        node: Node::leaf(Value::from(value)),
    }
}

fn modify(
    id: TransactionId,
    ops: Vec<ModOp>,
    protocol: Option<FinishProtocol>,
) -> Request {
    Request::Transaction(TransactionRequest {
        id,
        action: TransactionAction::Modify {
            ops,
            protocol,
            participating_shards: None,
        },
    })
}

fn action(id: TransactionId, action: TransactionAction) -> Request {
    Request::Transaction(TransactionRequest { id, action })
}

fn history(id: LocalHistoryId, act: HistoryAction) -> Request {
    Request::History(HistoryRequest { id, action: act })
}

async fn connect(harness: &Harness, generation: u64) {
    harness
        .handle
        .connect(ConnectRequest {
            frontend: frontend(),
            generation,
            min_version: 0,
            max_version: u32::MAX,
        })
        .await
        .unwrap();
}

async fn expect_ok(harness: &Harness, sequence: u64, request: Request) -> ResponseBody {
    let envelope = harness.handle.request(sequence, request).await.unwrap();
    envelope.result.expect("request failed")
}

async fn expect_err(harness: &Harness, sequence: u64, request: Request) -> SessionError {
    let envelope = harness.handle.request(sequence, request).await.unwrap();
    envelope.result.expect_err("request unexpectedly succeeded")
}

#[tokio::test]
async fn test_connect_negotiates_highest_common_version() {
    let harness = launch();
    let response = harness
        .handle
        .connect(ConnectRequest {
            frontend: frontend(),
            generation: 0,
            min_version: 0,
            max_version: SUPPORTED_VERSIONS[1],
        })
        .await
        .unwrap();
    assert_eq!(response.version, SUPPORTED_VERSIONS[1]);
}

#[tokio::test]
async fn test_connect_rejects_disjoint_versions() {
    let harness = launch();
    let result = harness
        .handle
        .connect(ConnectRequest {
            frontend: frontend(),
            generation: 0,
            min_version: u32::MAX - 1,
            max_version: u32::MAX,
        })
        .await;
    assert_eq!(result, Err(SessionError::UnsupportedVersion));
}

#[tokio::test]
async fn test_sequence_gap_is_rejected() {
    let harness = launch();
    connect(&harness, 0).await;

    let error = expect_err(
        &harness,
        5,
        modify(standalone_tx(0, 0), vec![merge_op("/a", 1)], None),
    )
    .await;
    assert_eq!(
        error,
        SessionError::OutOfOrder {
            expected: 0,
            actual: 5
        }
    );
}

#[tokio::test]
async fn test_simple_commit_roundtrip() {
    let harness = launch();
    connect(&harness, 0).await;

    let body = expect_ok(
        &harness,
        0,
        modify(
            standalone_tx(0, 0),
            vec![merge_op("/cars/car-1", 7)],
            Some(FinishProtocol::Simple),
        ),
    )
    .await;
    assert!(matches!(body, ResponseBody::CommitAck { .. }));

    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.exists(&TreePath::parse("/cars/car-1")));
}

#[tokio::test]
async fn test_three_phase_flow() {
    let harness = launch();
    connect(&harness, 0).await;
    let tx = standalone_tx(0, 0);

    let body = expect_ok(
        &harness,
        0,
        modify(
            tx.clone(),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::ThreePhase),
        ),
    )
    .await;
    assert_eq!(body, ResponseBody::CanCommitAck);

    let body = expect_ok(&harness, 1, action(tx.clone(), TransactionAction::PreCommit)).await;
    assert_eq!(body, ResponseBody::PreCommitAck);

    let body = expect_ok(&harness, 2, action(tx.clone(), TransactionAction::DoCommit)).await;
    assert!(matches!(body, ResponseBody::CommitAck { .. }));

    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.exists(&TreePath::parse("/a")));
}

#[tokio::test]
async fn test_reads_on_open_transaction() {
    let harness = launch();
    connect(&harness, 0).await;

    // Seed the tree.
    expect_ok(
        &harness,
        0,
        modify(
            standalone_tx(0, 0),
            vec![merge_op("/cars/car-1", 7)],
            Some(FinishProtocol::Simple),
        ),
    )
    .await;

    let tx = standalone_tx(0, 1);
    let body = expect_ok(
        &harness,
        1,
        action(
            tx.clone(),
            TransactionAction::Read {
                path: TreePath::parse("/cars/car-1"),
            },
        ),
    )
    .await;
    match body {
        ResponseBody::ReadData { data } => {
            assert_eq!(data.unwrap().value, Some(Value::from(7)))
        }
        other => panic!("unexpected body {:?}", other),
    }

    let body = expect_ok(
        &harness,
        2,
        action(
            tx,
            TransactionAction::Exists {
                path: TreePath::parse("/cars/car-2"),
            },
        ),
    )
    .await;
    assert_eq!(body, ResponseBody::ExistsData { present: false });
}

#[tokio::test]
async fn test_replay_returns_identical_response_without_side_effects() {
    let harness = launch();
    connect(&harness, 0).await;

    let first = harness
        .handle
        .request(
            0,
            modify(
                standalone_tx(0, 0),
                vec![merge_op("/a", 1)],
                Some(FinishProtocol::Simple),
            ),
        )
        .await
        .unwrap();
    assert!(first.result.is_ok());
    let decided_before = harness.log.decided_len();

    // The duplicate envelope re-sends the recorded response verbatim and
    // performs no further side effects.
    let replayed = harness
        .handle
        .request(
            0,
            modify(
                standalone_tx(0, 0),
                vec![merge_op("/a", 1)],
                Some(FinishProtocol::Simple),
            ),
        )
        .await
        .unwrap();
    assert_eq!(replayed, first);
    assert_eq!(harness.log.decided_len(), decided_before);
}

#[tokio::test]
async fn test_replay_below_purge_mark_is_rejected() {
    let harness = launch_with(|config| config.replay_window = 2);
    connect(&harness, 0).await;
    let tx = standalone_tx(0, 0);

    // Four recorded responses on one transaction with a window of two.
    for sequence in 0..4 {
        expect_ok(
            &harness,
            sequence,
            modify(tx.clone(), vec![merge_op("/a", sequence as i64)], None),
        )
        .await;
    }

    let error = expect_err(&harness, 0, modify(tx, vec![merge_op("/a", 0)], None)).await;
    assert_eq!(error, SessionError::DeadSequence(0));
}

#[tokio::test]
async fn test_generation_arbitration() {
    let harness = launch();
    connect(&harness, 1).await;

    expect_ok(
        &harness,
        0,
        modify(standalone_tx(1, 0), vec![merge_op("/a", 1)], None),
    )
    .await;

    // Lower generation is rejected outright.
    let result = harness
        .handle
        .connect(ConnectRequest {
            frontend: frontend(),
            generation: 0,
            min_version: 0,
            max_version: u32::MAX,
        })
        .await;
    assert_eq!(
        result,
        Err(SessionError::StaleGeneration {
            current: 1,
            actual: 0
        })
    );

    // Higher generation supersedes and starts a fresh sequence space.
    connect(&harness, 2).await;
    expect_ok(
        &harness,
        0,
        modify(standalone_tx(2, 0), vec![merge_op("/b", 1)], None),
    )
    .await;

    // Requests tagged with the old generation are rejected.
    let error = expect_err(
        &harness,
        1,
        modify(standalone_tx(1, 1), vec![merge_op("/c", 1)], None),
    )
    .await;
    assert!(matches!(error, SessionError::StaleGeneration { .. }));
}

#[tokio::test]
async fn test_superseded_generation_suppresses_in_flight_callbacks() {
    let harness = launch();
    connect(&harness, 0).await;

    // Drive a commit into COMMIT_PENDING while consensus is held.
    harness.log.pause();
    let (reply, mut pending) = oneshot::channel();
    assert!(harness.handle.submit(RequestEnvelope {
        sequence: 0,
        request: modify(
            standalone_tx(0, 0),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::Simple),
        ),
        reply,
    }));
    tokio::task::yield_now().await;
    assert!(pending.try_recv().is_err());

    // A newer generation retires everything the old one owned.
    connect(&harness, 1).await;
    harness.log.release();

    // The retired generation's reply never materializes.
    assert!(pending.await.is_err());

    // The new generation is fully operational.
    expect_ok(
        &harness,
        0,
        modify(
            standalone_tx(1, 0),
            vec![merge_op("/b", 2)],
            Some(FinishProtocol::Simple),
        ),
    )
    .await;
}

#[tokio::test]
async fn test_abort_then_purge_retires_bookkeeping() {
    let harness = launch();
    connect(&harness, 0).await;
    let tx = standalone_tx(0, 0);

    expect_ok(
        &harness,
        0,
        modify(
            tx.clone(),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::ThreePhase),
        ),
    )
    .await;

    let body = expect_ok(&harness, 1, action(tx.clone(), TransactionAction::Abort)).await;
    assert_eq!(body, ResponseBody::AbortAck);

    // Decided: further modifies classify as already aborted.
    let error = expect_err(&harness, 2, modify(tx.clone(), vec![merge_op("/a", 2)], None)).await;
    assert_eq!(error, SessionError::AlreadyAborted(tx.clone()));

    let body = expect_ok(&harness, 3, action(tx.clone(), TransactionAction::Purge)).await;
    assert_eq!(body, ResponseBody::PurgeAck);

    // Purged: the transaction no longer exists at all.
    let error = expect_err(&harness, 4, modify(tx.clone(), vec![merge_op("/a", 3)], None)).await;
    assert_eq!(error, SessionError::DeadTransaction(tx));

    // The aborted data never reached the tree.
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(!snapshot.exists(&TreePath::parse("/a")));
}

#[tokio::test]
async fn test_history_lifecycle() {
    let harness = launch();
    connect(&harness, 0).await;
    let history_id = LocalHistoryId::new(client(0), 1);

    let body = expect_ok(
        &harness,
        0,
        history(history_id.clone(), HistoryAction::Create),
    )
    .await;
    assert_eq!(body, ResponseBody::HistoryAck);

    // A transaction in the chained history commits normally.
    let tx = chained_tx(0, 1, 0);
    expect_ok(
        &harness,
        1,
        modify(
            tx,
            vec![merge_op("/chained", 1)],
            Some(FinishProtocol::Simple),
        ),
    )
    .await;

    let body = expect_ok(
        &harness,
        2,
        history(history_id.clone(), HistoryAction::Close),
    )
    .await;
    assert_eq!(body, ResponseBody::HistoryAck);

    // New transactions are refused on a closed history.
    let error = expect_err(
        &harness,
        3,
        modify(chained_tx(0, 1, 1), vec![merge_op("/late", 1)], None),
    )
    .await;
    assert_eq!(error, SessionError::ClosedHistory(history_id.clone()));

    let body = expect_ok(
        &harness,
        4,
        history(history_id.clone(), HistoryAction::Purge),
    )
    .await;
    assert_eq!(body, ResponseBody::HistoryAck);

    // Purged history: everything is dead.
    let error = expect_err(
        &harness,
        5,
        modify(chained_tx(0, 1, 2), vec![merge_op("/later", 1)], None),
    )
    .await;
    assert_eq!(error, SessionError::DeadHistory(history_id.clone()));
    let error = expect_err(&harness, 6, history(history_id, HistoryAction::Create)).await;
    assert!(matches!(error, SessionError::DeadHistory(_)));
}

#[tokio::test]
async fn test_history_decisions_are_replicated() {
    let harness = launch();
    connect(&harness, 0).await;
    let history_id = LocalHistoryId::new(client(0), 1);

    let decided_before = harness.log.decided_len();
    expect_ok(
        &harness,
        0,
        history(history_id.clone(), HistoryAction::Create),
    )
    .await;
    expect_ok(&harness, 1, history(history_id, HistoryAction::Purge)).await;

    // Both decisions went through the replication log.
    assert_eq!(harness.log.decided_len(), decided_before + 2);
}

#[tokio::test]
async fn test_expired_transaction_fails_next_step() {
    let harness = launch();
    connect(&harness, 0).await;
    let tx = standalone_tx(0, 0);

    expect_ok(
        &harness,
        0,
        modify(
            tx.clone(),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::ThreePhase),
        ),
    )
    .await;

    harness.ticker.advance(TIMEOUT_TICKS + 1);
    harness.handle.check_expired().await;

    let error = expect_err(&harness, 1, action(tx, TransactionAction::PreCommit)).await;
    assert_eq!(
        error,
        SessionError::Pipeline(PipelineError::Timeout {
            state: "CAN_COMMIT_COMPLETE"
        })
    );
}

#[tokio::test]
async fn test_recent_client_activity_defers_expiry() {
    let harness = launch();
    connect(&harness, 0).await;
    let tx = standalone_tx(0, 0);

    expect_ok(
        &harness,
        0,
        modify(
            tx.clone(),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::ThreePhase),
        ),
    )
    .await;

    harness.ticker.advance(TIMEOUT_TICKS + 1);
    // Any request from the owning client counts as liveness.
    expect_ok(
        &harness,
        1,
        action(
            standalone_tx(0, 1),
            TransactionAction::Exists {
                path: TreePath::parse("/a"),
            },
        ),
    )
    .await;
    harness.handle.check_expired().await;

    // The transaction survived and can continue.
    expect_ok(&harness, 2, action(tx.clone(), TransactionAction::PreCommit)).await;
    expect_ok(&harness, 3, action(tx, TransactionAction::DoCommit)).await;
}

#[tokio::test]
async fn test_leadership_loss_surrenders_state() {
    let harness = launch();
    connect(&harness, 0).await;

    // A commit waiting on consensus when leadership is lost.
    harness.log.pause();
    let (reply, pending) = oneshot::channel();
    assert!(harness.handle.submit(RequestEnvelope {
        sequence: 0,
        request: modify(
            standalone_tx(0, 0),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::Simple),
        ),
        reply,
    }));

    harness.handle.leadership_lost().await;
    harness.log.release();

    // The surrendered transaction never answers.
    assert!(pending.await.is_err());

    // Clients must reconnect before doing anything else.
    let error = expect_err(
        &harness,
        1,
        modify(standalone_tx(0, 1), vec![merge_op("/b", 1)], None),
    )
    .await;
    assert_eq!(error, SessionError::NoSession);

    connect(&harness, 0).await;
    expect_ok(
        &harness,
        0,
        modify(
            standalone_tx(0, 0),
            vec![merge_op("/c", 1)],
            Some(FinishProtocol::Simple),
        ),
    )
    .await;
}

#[tokio::test]
async fn test_request_without_session_is_rejected() {
    let harness = launch();
    let error = expect_err(
        &harness,
        0,
        modify(standalone_tx(0, 0), vec![merge_op("/a", 1)], None),
    )
    .await;
    assert_eq!(error, SessionError::NoSession);
}

#[tokio::test]
async fn test_commit_of_unprepared_transaction_is_a_contract_error() {
    let harness = launch();
    connect(&harness, 0).await;
    let tx = standalone_tx(0, 0);

    expect_ok(
        &harness,
        0,
        modify(
            tx.clone(),
            vec![merge_op("/a", 1)],
            Some(FinishProtocol::ThreePhase),
        ),
    )
    .await;

    // DoCommit without preCommit is gated at the session already.
    let error = expect_err(&harness, 1, action(tx, TransactionAction::DoCommit)).await;
    assert!(matches!(error, SessionError::UnexpectedRequest { .. }));
}
