// The session layer: wires the engine to a transport, dispatches inbound
// frames, and turns drop events (lost interest, dropped proxies) into
// Finish and Release traffic.

use crate::error::RpcError;
use crate::ids::{AnswerId, ConnectionId, ImportId, QuestionId};
use crate::protocol::cap::{Cap, CapHook, HookKind, Payload};
use crate::protocol::engine::{Engine, PostAction};
use crate::protocol::message::{Message, MessageTarget, MethodId};
use crate::protocol::promise::{replay_queued, CancelGuard, PipelineOps, StructRef};
use crate::transport::{RpcTransport, TransportRx, TransportTx};
use crate::RpcTarget;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub use crate::protocol::engine::ConnectionStats;

/// Connection-level configuration.
pub struct ConnectionOptions {
    /// The capability served to the peer's bootstrap requests.
    pub bootstrap: Option<Arc<dyn RpcTarget>>,
    /// Diagnostic labels attached to this session's tracing span.
    pub tags: Vec<String>,
    /// Level 3 is unimplemented; must stay false.
    pub allow_third_party_tail_call: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            bootstrap: None,
            tags: Vec::new(),
            allow_third_party_tail_call: false,
        }
    }
}

impl ConnectionOptions {
    pub fn with_bootstrap(bootstrap: Arc<dyn RpcTarget>) -> Self {
        ConnectionOptions {
            bootstrap: Some(bootstrap),
            ..Default::default()
        }
    }
}

/// Drop-triggered work, queued so destructors never touch the tables
/// directly (a drop can fire while the table lock is held).
pub(crate) enum Command {
    DropQuestion(QuestionId),
    ReleaseImport(ImportId),
}

pub(crate) struct ConnInner {
    id: ConnectionId,
    engine: Mutex<Engine>,
    /// Taken on teardown so the writer task drains and closes.
    out: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    cmd: mpsc::UnboundedSender<Command>,
    bootstrap_cap: Option<Cap>,
    span: tracing::Span,
}

/// One CapTP session over one transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({})", self.inner.id)
    }
}

impl Connection {
    /// Start a session over `transport`. Spawns the io tasks; must be
    /// called within a tokio runtime.
    pub fn new<T: RpcTransport>(
        transport: T,
        options: ConnectionOptions,
    ) -> Result<Connection, RpcError> {
        if options.allow_third_party_tail_call {
            return Err(RpcError::failed(
                "three-party tail calls are not supported",
            ));
        }
        let (tx, rx) = transport.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let id = ConnectionId::next();
        let span = tracing::debug_span!("rpc_session", conn = %id, tags = ?options.tags);
        let bootstrap_cap = options.bootstrap.map(Cap::local);
        let inner = Arc::new(ConnInner {
            id,
            engine: Mutex::new(Engine::new()),
            out: Mutex::new(Some(out_tx)),
            cmd: cmd_tx,
            bootstrap_cap,
            span,
        });
        tokio::spawn(run_writer(Arc::downgrade(&inner), tx, out_rx));
        tokio::spawn(run_reader(inner.clone(), rx, cmd_rx));
        debug!(conn = %id, "session started");
        Ok(Connection { inner })
    }

    /// The peer's bootstrap capability, as a pipelined promise: calls may
    /// be made on it immediately.
    pub fn bootstrap(&self) -> Cap {
        let struct_ref = {
            let mut engine = self.inner.engine.lock().unwrap();
            let struct_ref = engine.send_bootstrap(&self.inner);
            self.inner.flush_locked(&mut engine);
            struct_ref
        };
        struct_ref.get_pipelined(&[])
    }

    /// Table occupancy, mostly for tests and diagnostics.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.engine.lock().unwrap().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.engine.lock().unwrap().is_dead()
    }

    /// Tear the session down locally. Outstanding questions fail with
    /// `Disconnected`.
    pub fn close(&self) {
        self.inner
            .shutdown(RpcError::disconnected("connection closed locally"));
    }
}

impl ConnInner {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn cmd_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.cmd.clone()
    }

    pub(crate) fn bootstrap_cap(&self) -> Option<Cap> {
        self.bootstrap_cap.clone()
    }

    pub(crate) fn new_import_hook(self: &Arc<Self>, id: ImportId) -> Arc<ImportHook> {
        Arc::new(ImportHook {
            id,
            conn_id: self.id,
            conn: Arc::downgrade(self),
            cmd: self.cmd.clone(),
        })
    }

    pub(crate) fn new_question_pipeline(
        self: &Arc<Self>,
        question: QuestionId,
        guard: &Arc<CancelGuard>,
    ) -> Arc<dyn PipelineOps> {
        Arc::new(QuestionPipeline {
            conn_id: self.id,
            conn: Arc::downgrade(self),
            question,
            guard: Arc::downgrade(guard),
        })
    }

    /// Push the engine's pending frames onto the wire, in order, while the
    /// table lock is still held so concurrent senders cannot interleave.
    pub(crate) fn flush_locked(&self, engine: &mut Engine) {
        let frames = engine.take_frames();
        if frames.is_empty() {
            return;
        }
        let out = self.out.lock().unwrap();
        if let Some(sender) = out.as_ref() {
            for frame in frames {
                let _ = sender.send(frame);
            }
        }
    }

    fn send_call(
        self: &Arc<Self>,
        target: MessageTarget,
        method: MethodId,
        params: Payload,
    ) -> StructRef {
        let mut engine = self.engine.lock().unwrap();
        let struct_ref = engine.send_call(self, target, method, params);
        self.flush_locked(&mut engine);
        struct_ref
    }

    fn call_pipelined(
        self: &Arc<Self>,
        question: QuestionId,
        path: &[u16],
        method: MethodId,
        params: Payload,
    ) -> Result<StructRef, Payload> {
        let mut engine = self.engine.lock().unwrap();
        let result = engine.call_pipelined(self, question, path, method, params);
        self.flush_locked(&mut engine);
        result
    }

    fn handle_command(self: &Arc<Self>, command: Command) {
        let _limbo = {
            let mut engine = self.engine.lock().unwrap();
            if engine.is_dead() {
                return;
            }
            match command {
                Command::DropQuestion(qid) => engine.drop_question(qid),
                Command::ReleaseImport(id) => engine.release_import(id),
            }
            self.flush_locked(&mut engine);
            engine.take_limbo()
        };
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        let _enter = self.span.enter();
        if let Err(err) = self.handle_frame(msg) {
            error!(error = %err, "inbound frame was fatal");
            self.shutdown(err);
        }
    }

    fn handle_frame(self: &Arc<Self>, msg: Message) -> Result<(), RpcError> {
        let (actions, _limbo) = {
            let mut engine = self.engine.lock().unwrap();
            if engine.is_dead() {
                return Ok(());
            }
            let actions = match msg {
                Message::Bootstrap { question_id } => {
                    engine.handle_bootstrap(self, question_id)?
                }
                Message::Call {
                    question_id,
                    target,
                    method,
                    params,
                } => engine.handle_call(self, question_id, target, method, params)?,
                Message::Return {
                    answer_id,
                    release_param_caps,
                    kind,
                } => engine.handle_return(self, answer_id, release_param_caps, kind)?,
                Message::Finish {
                    question_id,
                    release_result_caps,
                } => {
                    engine.handle_finish(question_id, release_result_caps)?;
                    Vec::new()
                }
                Message::Release {
                    id,
                    reference_count,
                } => {
                    engine.handle_release(id, reference_count)?;
                    Vec::new()
                }
                Message::Disembargo { target, context } => {
                    engine.handle_disembargo(self, target, context)?
                }
                Message::Abort { error } => {
                    drop(engine);
                    warn!(reason = %error.message, "peer aborted the session");
                    self.shutdown(RpcError::disconnected(format!(
                        "peer aborted: {}",
                        error.message
                    )));
                    return Ok(());
                }
            };
            self.flush_locked(&mut engine);
            (actions, engine.take_limbo())
        };
        self.run_actions(actions);
        Ok(())
    }

    /// Run deferred work outside the table lock; everything here may
    /// re-enter the engine.
    fn run_actions(self: &Arc<Self>, actions: Vec<PostAction>) {
        for action in actions {
            match action {
                PostAction::Resolve { resolver, result } => resolver.resolve(result),
                PostAction::Replay { target, calls } => replay_queued(&target, calls),
                PostAction::ResolveAnswer {
                    answer,
                    answer_ref,
                    resolver,
                    result,
                } => {
                    self.watch_answer(answer, &answer_ref);
                    resolver.resolve(result);
                }
                PostAction::DispatchCall {
                    answer,
                    answer_ref,
                    resolver,
                    target,
                    method,
                    params,
                } => {
                    self.watch_answer(answer, &answer_ref);
                    let result_ref = target.call(method, params);
                    resolver.connect(&result_ref);
                }
            }
        }
    }

    /// Arrange for the Return to go out as soon as the answer settles.
    fn watch_answer(self: &Arc<Self>, answer: AnswerId, answer_ref: &StructRef) {
        let weak = Arc::downgrade(self);
        answer_ref.when_resolved(move |_| {
            if let Some(conn) = weak.upgrade() {
                conn.answer_ready(answer);
            }
        });
    }

    fn answer_ready(self: &Arc<Self>, answer: AnswerId) {
        let (outcome, _limbo) = {
            let mut engine = self.engine.lock().unwrap();
            if engine.is_dead() {
                return;
            }
            let outcome = engine.return_answer(self, answer);
            self.flush_locked(&mut engine);
            (outcome, engine.take_limbo())
        };
        if let Err(err) = outcome {
            self.shutdown(err);
        }
    }

    pub(crate) fn shutdown(self: &Arc<Self>, err: RpcError) {
        let (actions, _limbo) = {
            let mut engine = self.engine.lock().unwrap();
            if engine.is_dead() {
                return;
            }
            if err.is_fatal() {
                engine.push_frame(Message::Abort { error: err.clone() });
            }
            let actions = engine.teardown(err);
            self.flush_locked(&mut engine);
            // Dropping the sender lets the writer drain and close.
            *self.out.lock().unwrap() = None;
            (actions, engine.take_limbo())
        };
        self.run_actions(actions);
    }
}

/// Proxy for a capability the peer hosts. Dropping the last handle queues
/// the Release carrying every reference we accumulated.
pub(crate) struct ImportHook {
    id: ImportId,
    conn_id: ConnectionId,
    conn: Weak<ConnInner>,
    cmd: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for ImportHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImportHook({})", self.id)
    }
}

impl CapHook for ImportHook {
    fn call(&self, method: MethodId, params: Payload) -> StructRef {
        match self.conn.upgrade() {
            Some(conn) => conn.send_call(
                MessageTarget::ImportedCap {
                    id: self.id.as_export(),
                },
                method,
                params,
            ),
            None => StructRef::resolved(Err(RpcError::disconnected("connection is closed"))),
        }
    }

    fn resolved(&self) -> Option<Cap> {
        None
    }

    fn kind(&self) -> HookKind {
        HookKind::Import {
            conn: self.conn_id,
            id: self.id,
        }
    }
}

impl Drop for ImportHook {
    fn drop(&mut self) {
        let _ = self.cmd.send(Command::ReleaseImport(self.id));
    }
}

/// PipelineOps for an outstanding question: pipelined caps created from its
/// promise send their calls over the wire instead of queueing.
struct QuestionPipeline {
    conn_id: ConnectionId,
    conn: Weak<ConnInner>,
    question: QuestionId,
    guard: Weak<CancelGuard>,
}

impl PipelineOps for QuestionPipeline {
    fn question(&self) -> (ConnectionId, QuestionId) {
        (self.conn_id, self.question)
    }

    fn pipelined_call(
        &self,
        path: &[u16],
        method: MethodId,
        params: Payload,
    ) -> Result<StructRef, Payload> {
        match self.conn.upgrade() {
            Some(conn) => conn.call_pipelined(self.question, path, method, params),
            None => Ok(StructRef::resolved(Err(RpcError::disconnected(
                "connection is closed",
            )))),
        }
    }

    fn keep_alive(&self) -> Option<Arc<CancelGuard>> {
        self.guard.upgrade()
    }
}

async fn run_writer<T: TransportTx>(
    inner: Weak<ConnInner>,
    mut tx: T,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(err) = tx.send(msg).await {
            if let Some(conn) = inner.upgrade() {
                conn.shutdown(RpcError::disconnected(format!(
                    "transport send failed: {}",
                    err
                )));
            }
            break;
        }
    }
    let _ = tx.close().await;
}

async fn run_reader<R: TransportRx>(
    inner: Arc<ConnInner>,
    mut rx: R,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(command) => inner.handle_command(command),
                None => break,
            },
            frame = rx.recv() => match frame {
                Ok(Some(msg)) => {
                    inner.dispatch(msg);
                    if inner.engine.lock().unwrap().is_dead() {
                        break;
                    }
                }
                Ok(None) => {
                    inner.shutdown(RpcError::disconnected("peer closed the connection"));
                    break;
                }
                Err(err) => {
                    inner.shutdown(RpcError::disconnected(format!(
                        "transport receive failed: {}",
                        err
                    )));
                    break;
                }
            },
        }
    }
}
