// End-to-end protocol scenarios: two sessions wired back to back over the
// in-memory transport, with a recording layer on each outbound half.

use async_trait::async_trait;
use captp_core::{
    Cap, Connection, ConnectionOptions, ConnectionStats, DisembargoContext, ErrorCode, Message,
    MessageTarget, MethodId, Payload, ReturnKind, RpcError, RpcTarget, RpcTransport,
    TransportError, TransportRx, TransportTx,
};
use captp_transport::{memory_pipe, MemoryTransport};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const IFACE: u64 = 0x00c5_a119_0000_0001;

const PING: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 0,
};
const GET_SERVICE: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 1,
};
const REGISTER: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 2,
};
const GET_SELF: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 3,
};
const ECHO_CAP: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 4,
};
const FAIL: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 5,
};
const SLOW: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 6,
};
const FRESH_SERVICE: MethodId = MethodId {
    interface_id: IFACE,
    method_id: 7,
};

const OP: u64 = 0x00c5_a119_0000_0002;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("captp=debug")),
        )
        .try_init();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---- frame recording -----------------------------------------------------

#[derive(Clone, Default)]
struct FrameLog(Arc<Mutex<Vec<Message>>>);

impl FrameLog {
    fn snapshot(&self) -> Vec<Message> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|m| predicate(m)).count()
    }
}

struct Recorded {
    inner: MemoryTransport,
    log: FrameLog,
}

struct RecordedTx<T> {
    inner: T,
    log: FrameLog,
}

impl RpcTransport for Recorded {
    type Tx = RecordedTx<<MemoryTransport as RpcTransport>::Tx>;
    type Rx = <MemoryTransport as RpcTransport>::Rx;

    fn split(self) -> (Self::Tx, Self::Rx) {
        let (tx, rx) = self.inner.split();
        (
            RecordedTx {
                inner: tx,
                log: self.log,
            },
            rx,
        )
    }
}

#[async_trait]
impl<T: TransportTx> TransportTx for RecordedTx<T> {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.log.0.lock().unwrap().push(msg.clone());
        self.inner.send(msg).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

// ---- test services -------------------------------------------------------

/// Records the method ids it sees, in delivery order.
#[derive(Debug, Default)]
struct Recorder(Mutex<Vec<u16>>);

#[async_trait]
impl RpcTarget for Recorder {
    async fn call(&self, method: MethodId, _params: Payload) -> Result<Payload, RpcError> {
        self.0.lock().unwrap().push(method.method_id);
        Ok(Payload::empty())
    }
}

/// Sets its flag when dropped, to observe the release path end to end.
#[derive(Debug)]
struct DropSpy {
    flag: Arc<AtomicBool>,
}

#[async_trait]
impl RpcTarget for DropSpy {
    async fn call(&self, _method: MethodId, _params: Payload) -> Result<Payload, RpcError> {
        Ok(Payload::empty())
    }
}

impl Drop for DropSpy {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// The server's bootstrap service for every scenario.
#[derive(Debug)]
struct Hub {
    ops: Cap,
    registered: Mutex<Option<Cap>>,
    drop_flag: Arc<AtomicBool>,
}

impl Hub {
    fn new() -> Self {
        Hub {
            ops: Cap::local(Arc::new(Recorder::default())),
            registered: Mutex::new(None),
            drop_flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl RpcTarget for Hub {
    async fn call(&self, method: MethodId, params: Payload) -> Result<Payload, RpcError> {
        match method {
            PING => Ok(Payload::new(json!(0), vec![])),
            GET_SERVICE => {
                // Slow enough that pipelined calls are genuinely in flight.
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Payload::single_cap(self.ops.clone()))
            }
            REGISTER => {
                let cap = params.cap_at(&[])?;
                *self.registered.lock().unwrap() = Some(cap);
                Ok(Payload::empty())
            }
            GET_SELF => {
                // Slow enough that pipelined calls are genuinely in flight.
                tokio::time::sleep(Duration::from_millis(30)).await;
                let cap = self
                    .registered
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| RpcError::failed("nothing registered"))?;
                Ok(Payload::single_cap(cap))
            }
            ECHO_CAP => Ok(Payload::single_cap(params.cap_at(&[])?)),
            FAIL => Err(RpcError::failed("deliberate failure")),
            SLOW => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Payload::new(json!("slow done"), vec![]))
            }
            FRESH_SERVICE => Ok(Payload::single_cap(Cap::local(Arc::new(DropSpy {
                flag: self.drop_flag.clone(),
            })))),
            _ => Err(RpcError::failed(format!("no such method {}", method))),
        }
    }
}

fn linked_pair(hub: Arc<Hub>) -> (Connection, Connection, FrameLog, FrameLog) {
    let (a, b) = memory_pipe(64);
    let client_log = FrameLog::default();
    let server_log = FrameLog::default();
    let client = Connection::new(
        Recorded {
            inner: a,
            log: client_log.clone(),
        },
        ConnectionOptions {
            tags: vec!["client".to_string()],
            ..Default::default()
        },
    )
    .unwrap();
    let server = Connection::new(
        Recorded {
            inner: b,
            log: server_log.clone(),
        },
        ConnectionOptions {
            bootstrap: Some(hub),
            tags: vec!["server".to_string()],
            ..Default::default()
        },
    )
    .unwrap();
    (client, server, client_log, server_log)
}

// ---- scenarios -----------------------------------------------------------

#[tokio::test]
async fn test_bootstrap_ping() {
    init_tracing();
    let (client, server, client_log, server_log) = linked_pair(Arc::new(Hub::new()));

    let boot = client.bootstrap();
    let result = boot
        .call(PING, Payload::empty())
        .await_resolved()
        .await
        .unwrap();
    assert_eq!(result.content, json!(0));
    println!("✅ ping answered");

    drop(boot);
    settle().await;

    assert_eq!(
        client_log.count(|m| matches!(m, Message::Bootstrap { .. })),
        1
    );
    assert_eq!(client_log.count(|m| matches!(m, Message::Call { .. })), 1);
    assert_eq!(client_log.count(|m| matches!(m, Message::Finish { .. })), 2);
    assert_eq!(server_log.count(|m| matches!(m, Message::Return { .. })), 2);
    assert_eq!(server_log.count(|m| matches!(m, Message::Call { .. })), 0);

    assert_eq!(client.stats(), ConnectionStats::default());
    assert_eq!(server.stats(), ConnectionStats::default());
    println!("✅ all tables drained to zero");
}

#[tokio::test]
async fn test_promise_pipelining() {
    init_tracing();
    let (client, _server, client_log, _server_log) = linked_pair(Arc::new(Hub::new()));

    let boot = client.bootstrap();
    // No awaits between these: both calls ride the unresolved promises.
    let service_result = boot.call(GET_SERVICE, Payload::empty());
    let service = service_result.get_pipelined(&[]);
    let op_result = service.call(MethodId::new(OP, 1), Payload::empty());

    op_result.await_resolved().await.unwrap();
    println!("✅ pipelined op completed");

    let frames = client_log.snapshot();
    assert!(matches!(frames[0], Message::Bootstrap { .. }));
    let first_call_q = match &frames[1] {
        Message::Call { question_id, .. } => *question_id,
        other => panic!("expected first call, got {:?}", other),
    };
    match &frames[2] {
        Message::Call { target, .. } => match target {
            MessageTarget::PromisedAnswer { question_id, .. } => {
                assert_eq!(*question_id, first_call_q);
            }
            other => panic!("second call should pipeline on the first, got {:?}", other),
        },
        other => panic!("expected pipelined call, got {:?}", other),
    }
    println!("✅ wire order: bootstrap, call, pipelined call");
}

#[tokio::test]
async fn test_embargo_preserves_call_order() {
    init_tracing();
    let (client, _server, client_log, server_log) = linked_pair(Arc::new(Hub::new()));

    let recorder = Arc::new(Recorder::default());
    let local = Cap::local(recorder.clone());

    let boot = client.bootstrap();
    boot.call(REGISTER, Payload::single_cap(local.clone()))
        .await_resolved()
        .await
        .unwrap();

    let self_result = boot.call(GET_SELF, Payload::empty());
    let pipelined = self_result.get_pipelined(&[]);
    // In flight while the return travels toward us.
    let first = pipelined.call(MethodId::new(OP, 10), Payload::empty());

    let resolved = self_result.await_resolved().await.unwrap();
    let returned = resolved.cap_at(&[]).unwrap();
    // Subsequent calls on the loopback cap queue behind the disembargo.
    let second = returned.call(MethodId::new(OP, 11), Payload::empty());
    let third = returned.call(MethodId::new(OP, 12), Payload::empty());

    for result in [&first, &second, &third] {
        result.await_resolved().await.unwrap();
    }
    assert_eq!(*recorder.0.lock().unwrap(), vec![10, 11, 12]);
    println!("✅ pipelined call delivered before queued local calls");

    assert_eq!(
        client_log.count(|m| matches!(
            m,
            Message::Disembargo {
                context: DisembargoContext::SenderLoopback { .. },
                ..
            }
        )),
        1
    );
    assert_eq!(
        server_log.count(|m| matches!(
            m,
            Message::Disembargo {
                context: DisembargoContext::ReceiverLoopback { .. },
                ..
            }
        )),
        1
    );
    println!("✅ disembargo round trip observed");

    // Once disembargoed, the wrapper shortens to the original local cap.
    assert!(returned.shortest().eq_identity(&local));
    assert_eq!(client.stats().embargoes, 0);
}

#[tokio::test]
async fn test_release_drops_server_export() {
    init_tracing();
    let hub = Arc::new(Hub::new());
    let (client, server, client_log, _server_log) = linked_pair(hub.clone());

    let boot = client.bootstrap();
    let service = boot
        .call(FRESH_SERVICE, Payload::empty())
        .await_resolved()
        .await
        .unwrap()
        .cap_at(&[])
        .unwrap();
    assert_eq!(server.stats().exports, 2); // bootstrap + fresh service

    drop(service);
    settle().await;

    assert_eq!(
        client_log.count(|m| matches!(
            m,
            Message::Release {
                reference_count: 1,
                ..
            }
        )),
        1
    );
    assert_eq!(server.stats().exports, 1); // only the bootstrap remains
    assert!(
        hub.drop_flag.load(Ordering::SeqCst),
        "releasing the last wire ref must drop the service"
    );
    println!("✅ release retired the export and dropped the service");
}

#[tokio::test]
async fn test_exception_resolves_only_that_call() {
    init_tracing();
    let (client, server, _client_log, server_log) = linked_pair(Arc::new(Hub::new()));

    let boot = client.bootstrap();
    let err = boot
        .call(FAIL, Payload::empty())
        .await_resolved()
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Failed);
    assert!(err.message.contains("deliberate failure"));

    assert_eq!(
        server_log.count(|m| matches!(
            m,
            Message::Return {
                kind: ReturnKind::Exception { .. },
                ..
            }
        )),
        1
    );

    // The session survives: the next call works.
    let result = boot
        .call(PING, Payload::empty())
        .await_resolved()
        .await
        .unwrap();
    assert_eq!(result.content, json!(0));

    settle().await;
    assert_eq!(client.stats().questions, 0);
    assert_eq!(server.stats().answers, 0);
    println!("✅ exception contained to one call");
}

#[tokio::test]
async fn test_cancellation_before_return() {
    init_tracing();
    let (client, server, client_log, server_log) = linked_pair(Arc::new(Hub::new()));

    let boot = client.bootstrap();
    // Warm up so the bootstrap question is settled before we cancel.
    boot.call(PING, Payload::empty())
        .await_resolved()
        .await
        .unwrap();

    let slow = boot.call(SLOW, Payload::empty());
    drop(slow);
    settle().await;

    assert_eq!(
        client_log.count(|m| matches!(
            m,
            Message::Finish {
                release_result_caps: true,
                ..
            }
        )),
        1
    );
    println!("✅ cancel finish sent");

    // Let the slow call complete server-side; it must return Canceled.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        server_log.count(|m| matches!(
            m,
            Message::Return {
                kind: ReturnKind::Canceled,
                ..
            }
        )),
        1
    );
    assert_eq!(client.stats().questions, 0);
    assert_eq!(server.stats().answers, 0);
    println!("✅ canceled answer retired cleanly");
}

// ---- properties ----------------------------------------------------------

#[tokio::test]
async fn test_round_tripped_cap_keeps_identity() {
    init_tracing();
    let (client, _server, _client_log, _server_log) = linked_pair(Arc::new(Hub::new()));

    let local = Cap::local(Arc::new(Recorder::default()));
    let boot = client.bootstrap();
    let returned = boot
        .call(ECHO_CAP, Payload::single_cap(local.clone()))
        .await_resolved()
        .await
        .unwrap()
        .cap_at(&[])
        .unwrap();

    assert!(
        returned.eq_identity(&local),
        "a cap sent out and received back must be the original object, not a proxy"
    );
    println!("✅ round trip preserved identity");
}

#[tokio::test]
async fn test_bootstrap_without_configured_capability_fails() {
    init_tracing();
    let (a, b) = memory_pipe(8);
    let client = Connection::new(a, ConnectionOptions::default()).unwrap();
    let _server = Connection::new(b, ConnectionOptions::default()).unwrap();

    let boot = client.bootstrap();
    let err = boot
        .call(PING, Payload::empty())
        .await_resolved()
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Failed);
    assert!(err.message.contains("no bootstrap capability"));
}

#[tokio::test]
async fn test_protocol_error_aborts_session() {
    init_tracing();
    let (a, b) = memory_pipe(8);
    let client = Connection::new(a, ConnectionOptions::default()).unwrap();
    let (mut peer_tx, mut peer_rx) = b.split();

    let boot = client.bootstrap();
    match peer_rx.recv().await.unwrap().unwrap() {
        Message::Bootstrap { .. } => {}
        other => panic!("expected bootstrap, got {:?}", other),
    }

    // Release an export that was never allocated: connection-fatal.
    peer_tx
        .send(Message::Release {
            id: captp_core::ImportId::new(99),
            reference_count: 1,
        })
        .await
        .unwrap();

    match peer_rx.recv().await.unwrap().unwrap() {
        Message::Abort { error } => assert_eq!(error.code, ErrorCode::Protocol),
        other => panic!("expected abort, got {:?}", other),
    }
    settle().await;

    assert!(client.is_closed());
    let err = boot
        .call(PING, Payload::empty())
        .await_resolved()
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Protocol);
    println!("✅ protocol error tore the session down");
}

#[tokio::test]
async fn test_third_party_tail_call_option_is_refused() {
    let (a, _b) = memory_pipe(8);
    let err = Connection::new(
        a,
        ConnectionOptions {
            allow_third_party_tail_call: true,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::Failed);
}

#[tokio::test]
async fn test_peer_disconnect_fails_outstanding_questions() {
    init_tracing();
    let (a, b) = memory_pipe(8);
    let client = Connection::new(a, ConnectionOptions::default()).unwrap();

    let boot = client.bootstrap();
    let pending = boot.call(PING, Payload::empty());

    drop(b); // peer vanishes
    let err = pending.await_resolved().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Disconnected);
    assert!(client.is_closed());
}
