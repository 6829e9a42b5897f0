// Struct promises and capability promises: the graph that buffers
// pipelined work until a resolution arrives, then forwards and collapses.

use crate::error::RpcError;
use crate::ids::{ConnectionId, QuestionId};
use crate::protocol::cap::{Cap, CapHook, HookKind, Payload};
use crate::protocol::message::{MethodId, PipelinePath};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error};

type Waiter = Box<dyn FnOnce(&Result<Payload, RpcError>) + Send>;

type Shared = Arc<Mutex<PromiseState>>;

/// Hook installed on promises whose pipelined caps have a remote identity
/// (the question table installs one per outstanding question). While the
/// promise is unresolved, pipelined calls travel the wire instead of queueing.
pub(crate) trait PipelineOps: Send + Sync {
    /// Identity of the question this pipeline rides on.
    fn question(&self) -> (ConnectionId, QuestionId);

    /// Issue a pipelined call for `path`. `Err` hands the params back: the
    /// question has already settled and the caller should re-check the
    /// cap's state.
    fn pipelined_call(
        &self,
        path: &[u16],
        method: MethodId,
        params: Payload,
    ) -> Result<StructRef, Payload>;

    /// An owner token pipelined caps must hold so dropping the user-facing
    /// handles alone does not cancel the question out from under them.
    fn keep_alive(&self) -> Option<Arc<CancelGuard>>;
}

struct PromiseState {
    resolution: Option<Result<Payload, RpcError>>,
    waiters: Vec<Waiter>,
    pipeline: HashMap<PipelinePath, Arc<PromiseCapHook>>,
    pipeline_ops: Option<Arc<dyn PipelineOps>>,
    /// The promise feeding this one via `connect`, for cycle refusal.
    upstream: Option<Weak<Mutex<PromiseState>>>,
}

impl PromiseState {
    fn new(pipeline_ops: Option<Arc<dyn PipelineOps>>) -> Self {
        PromiseState {
            resolution: None,
            waiters: Vec::new(),
            pipeline: HashMap::new(),
            pipeline_ops,
            upstream: None,
        }
    }
}

/// Runs its closure when the last handle holding it drops; used to turn
/// "caller lost interest" into a Finish.
pub(crate) struct CancelGuard {
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancelGuard {
    pub(crate) fn new(on_cancel: Box<dyn FnOnce() + Send>) -> Self {
        CancelGuard {
            on_cancel: Mutex::new(Some(on_cancel)),
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_cancel.lock().unwrap().take() {
            f();
        }
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelGuard")
    }
}

/// A handle for a possibly unresolved call result.
#[derive(Clone)]
pub struct StructRef {
    shared: Shared,
    _guard: Option<Arc<CancelGuard>>,
}

impl fmt::Debug for StructRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.lock().unwrap().resolution {
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
            None => "unresolved",
        };
        write!(f, "StructRef({})", state)
    }
}

/// The write end of a StructRef.
pub struct StructResolver {
    shared: Shared,
    armed: bool,
}

impl fmt::Debug for StructResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StructResolver")
    }
}

impl StructRef {
    /// A fresh unresolved promise with its resolver.
    pub fn promise() -> (StructRef, StructResolver) {
        new_promise(None, None)
    }

    /// An already-settled promise.
    pub fn resolved(result: Result<Payload, RpcError>) -> StructRef {
        let (struct_ref, resolver) = StructRef::promise();
        resolver.resolve(result);
        struct_ref
    }

    /// Current resolution state, if any.
    pub fn response(&self) -> Option<Result<Payload, RpcError>> {
        self.shared.lock().unwrap().resolution.clone()
    }

    /// Run `f` once this promise settles. Fires synchronously, from the
    /// resolving task; if already settled, fires before returning.
    pub fn when_resolved<F>(&self, f: F)
    where
        F: FnOnce(&Result<Payload, RpcError>) + Send + 'static,
    {
        let mut state = self.shared.lock().unwrap();
        if let Some(result) = state.resolution.clone() {
            drop(state);
            f(&result);
        } else {
            state.waiters.push(Box::new(f));
        }
    }

    /// Await the resolution.
    pub async fn await_resolved(&self) -> Result<Payload, RpcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.when_resolved(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await
            .unwrap_or_else(|_| Err(RpcError::disconnected("promise was abandoned")))
    }

    /// The capability `path` addresses in the eventual result. Unresolved
    /// promises hand out one interned proxy per path; calls on it are
    /// pipelined or queued until resolution.
    pub fn get_pipelined(&self, path: &[u16]) -> Cap {
        let mut state = self.shared.lock().unwrap();
        if let Some(result) = state.resolution.clone() {
            drop(state);
            return pipeline_target(&result, path);
        }
        if let Some(existing) = state.pipeline.get(path) {
            return Cap::from_hook(existing.clone());
        }
        let hook = match &state.pipeline_ops {
            Some(ops) => PromiseCapHook::pending_remote(ops.clone(), path.to_vec()),
            None => PromiseCapHook::pending_local(),
        };
        state.pipeline.insert(path.to_vec(), hook.clone());
        Cap::from_hook(hook)
    }

    /// Relinquish interest in the result. Equivalent to dropping the last
    /// clone: for a question this triggers Finish.
    pub fn finish(self) {}
}

impl StructResolver {
    /// Settle the promise: waiters flush in registration order, then every
    /// pipelined cap resolves against the payload.
    pub fn resolve(mut self, result: Result<Payload, RpcError>) {
        self.armed = false;
        resolve_shared(&self.shared, result);
    }

    /// Forward `other`'s eventual resolution into this promise. Refuses to
    /// create a loop; the refused promise settles with a protocol error.
    pub fn connect(mut self, other: &StructRef) {
        self.armed = false;
        if would_cycle(&self.shared, &other.shared) {
            error!("promise connect would create a resolution cycle");
            resolve_shared(
                &self.shared,
                Err(RpcError::protocol("promise resolution cycle")),
            );
            return;
        }
        {
            let mut state = self.shared.lock().unwrap();
            state.upstream = Some(Arc::downgrade(&other.shared));
        }
        let shared = self.shared.clone();
        other.when_resolved(move |result| {
            resolve_shared(&shared, result.clone());
        });
    }

    /// Drain the interned pipelined caps without settling the promise. The
    /// engine uses this to transition question pipelines under its own lock
    /// before any further pipelined send can slip past the resolution.
    pub(crate) fn take_pipeline(&self) -> Vec<(PipelinePath, Arc<PromiseCapHook>)> {
        self.shared.lock().unwrap().pipeline.drain().collect()
    }
}

impl Drop for StructResolver {
    fn drop(&mut self) {
        if self.armed {
            resolve_shared(
                &self.shared,
                Err(RpcError::failed("promise was dropped without being resolved")),
            );
        }
    }
}

pub(crate) fn new_promise(
    pipeline_ops: Option<Arc<dyn PipelineOps>>,
    guard: Option<Arc<CancelGuard>>,
) -> (StructRef, StructResolver) {
    let shared = Arc::new(Mutex::new(PromiseState::new(pipeline_ops)));
    (
        StructRef {
            shared: shared.clone(),
            _guard: guard,
        },
        StructResolver {
            shared,
            armed: true,
        },
    )
}

fn would_cycle(ours: &Shared, target: &Shared) -> bool {
    if Arc::ptr_eq(ours, target) {
        return true;
    }
    let mut cursor = target.clone();
    for _ in 0..64 {
        let upstream = match cursor.lock().unwrap().upstream.clone() {
            Some(weak) => weak,
            None => return false,
        };
        let upstream = match upstream.upgrade() {
            Some(strong) => strong,
            None => return false,
        };
        if Arc::ptr_eq(ours, &upstream) {
            return true;
        }
        cursor = upstream;
    }
    // A chain this deep is itself suspect; refuse rather than loop.
    true
}

fn resolve_shared(shared: &Shared, result: Result<Payload, RpcError>) {
    let (waiters, pipeline) = {
        let mut state = shared.lock().unwrap();
        if state.resolution.is_some() {
            error!("promise resolved twice; dropping the second resolution");
            return;
        }
        state.resolution = Some(result.clone());
        state.upstream = None;
        state.pipeline_ops = None;
        (
            std::mem::take(&mut state.waiters),
            state.pipeline.drain().collect::<Vec<_>>(),
        )
    };
    for waiter in waiters {
        waiter(&result);
    }
    for (path, hook) in pipeline {
        let target = pipeline_target(&result, &path);
        let queued = hook.resolve(target.clone());
        replay_queued(&target, queued);
    }
}

/// The capability a settled result exposes at `path`.
fn pipeline_target(result: &Result<Payload, RpcError>, path: &[u16]) -> Cap {
    match result {
        Ok(payload) => match payload.cap_at(path) {
            Ok(cap) => cap.shortest(),
            Err(e) => Cap::broken(e),
        },
        Err(e) => Cap::broken(e.clone()),
    }
}

/// A buffered call awaiting its target.
pub(crate) struct QueuedCall {
    pub(crate) method: MethodId,
    pub(crate) params: Payload,
    pub(crate) resolver: StructResolver,
}

/// Issue buffered calls against the now-known target, in original order.
pub(crate) fn replay_queued(target: &Cap, calls: Vec<QueuedCall>) {
    for call in calls {
        let result = target.call(call.method, call.params);
        call.resolver.connect(&result);
    }
}

enum PromiseCapState {
    Pending {
        queued: Vec<QueuedCall>,
        remote: Option<Remote>,
    },
    Forwarding(Cap),
}

struct Remote {
    ops: Arc<dyn PipelineOps>,
    path: PipelinePath,
    /// Keeps the question's cancel guard alive while this cap exists.
    _keep_alive: Option<Arc<CancelGuard>>,
}

/// A promise-for-a-capability: queues (or pipelines) calls until resolved,
/// then forwards. Also the substrate of embargo caps, which are queue-only
/// promise caps released by a disembargo echo.
pub(crate) struct PromiseCapHook {
    state: Mutex<PromiseCapState>,
}

impl fmt::Debug for PromiseCapHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock().unwrap() {
            PromiseCapState::Pending { queued, remote } => {
                if remote.is_some() {
                    format!("pipelining({} queued)", queued.len())
                } else {
                    format!("pending({} queued)", queued.len())
                }
            }
            PromiseCapState::Forwarding(_) => "forwarding".to_string(),
        };
        write!(f, "PromiseCapHook({})", state)
    }
}

impl PromiseCapHook {
    pub(crate) fn pending_local() -> Arc<Self> {
        Arc::new(PromiseCapHook {
            state: Mutex::new(PromiseCapState::Pending {
                queued: Vec::new(),
                remote: None,
            }),
        })
    }

    pub(crate) fn pending_remote(ops: Arc<dyn PipelineOps>, path: PipelinePath) -> Arc<Self> {
        let keep_alive = ops.keep_alive();
        Arc::new(PromiseCapHook {
            state: Mutex::new(PromiseCapState::Pending {
                queued: Vec::new(),
                remote: Some(Remote {
                    ops,
                    path,
                    _keep_alive: keep_alive,
                }),
            }),
        })
    }

    /// Transition to forwarding and hand back whatever was queued. The
    /// caller replays the queue once it is safe to issue calls. Resolving
    /// twice is a protocol bug; the second resolution is dropped.
    pub(crate) fn resolve(&self, target: Cap) -> Vec<QueuedCall> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            PromiseCapState::Pending { queued, .. } => {
                let queued = std::mem::take(queued);
                debug!(queued = queued.len(), "capability promise resolved");
                *state = PromiseCapState::Forwarding(target.shortest());
                queued
            }
            PromiseCapState::Forwarding(_) => {
                error!("capability promise resolved twice");
                Vec::new()
            }
        }
    }
}

impl CapHook for PromiseCapHook {
    fn call(&self, method: MethodId, params: Payload) -> StructRef {
        let mut params = params;
        let mut attempted_remote = false;
        loop {
            enum Step {
                Forward(Cap),
                Remote(Arc<dyn PipelineOps>, PipelinePath),
            }
            let step = {
                let mut state = self.state.lock().unwrap();
                match &mut *state {
                    PromiseCapState::Forwarding(cap) => Step::Forward(cap.clone()),
                    PromiseCapState::Pending { remote: Some(r), .. } if !attempted_remote => {
                        Step::Remote(r.ops.clone(), r.path.clone())
                    }
                    PromiseCapState::Pending { queued, .. } => {
                        // Either a plain local promise, or the question
                        // settled mid-call: the pending resolution will
                        // replay the queue for us.
                        let (struct_ref, resolver) = StructRef::promise();
                        queued.push(QueuedCall {
                            method,
                            params,
                            resolver,
                        });
                        return struct_ref;
                    }
                }
            };
            match step {
                Step::Forward(cap) => return cap.call(method, params),
                Step::Remote(ops, path) => match ops.pipelined_call(&path, method, params) {
                    Ok(struct_ref) => return struct_ref,
                    Err(returned) => {
                        // The question settled while we weren't holding the
                        // lock; re-check, queueing if we are still pending.
                        params = returned;
                        attempted_remote = true;
                    }
                },
            }
        }
    }

    fn resolved(&self) -> Option<Cap> {
        match &*self.state.lock().unwrap() {
            PromiseCapState::Forwarding(cap) => Some(cap.clone()),
            PromiseCapState::Pending { .. } => None,
        }
    }

    fn kind(&self) -> HookKind {
        match &*self.state.lock().unwrap() {
            PromiseCapState::Pending { remote: Some(r), .. } => {
                let (conn, question) = r.ops.question();
                HookKind::PipelinedAnswer {
                    conn,
                    question,
                    path: r.path.clone(),
                }
            }
            _ => HookKind::Promise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::message::cap_marker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_waiters_flush_in_order() {
        let (struct_ref, resolver) = StructRef::promise();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            struct_ref.when_resolved(move |_| order.lock().unwrap().push(i));
        }
        resolver.resolve(Ok(Payload::empty()));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_when_resolved_after_resolution_fires_inline() {
        let struct_ref = StructRef::resolved(Ok(Payload::empty()));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        struct_ref.when_resolved(move |result| {
            assert!(result.is_ok());
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pipelined_caps_are_interned() {
        let (struct_ref, _resolver) = StructRef::promise();
        let a = struct_ref.get_pipelined(&[0, 1]);
        let b = struct_ref.get_pipelined(&[0, 1]);
        let c = struct_ref.get_pipelined(&[0]);
        assert!(a.eq_identity(&b));
        assert!(!a.eq_identity(&c));
    }

    #[test]
    fn test_connect_forwards_resolution() {
        let (a_ref, a_resolver) = StructRef::promise();
        let (b_ref, b_resolver) = StructRef::promise();
        a_resolver.connect(&b_ref);
        assert!(a_ref.response().is_none());
        b_resolver.resolve(Ok(Payload::new(json!(5), vec![])));
        assert_eq!(a_ref.response().unwrap().unwrap().content, json!(5));
    }

    #[test]
    fn test_connect_cycle_is_refused() {
        let (a_ref, a_resolver) = StructRef::promise();
        let (b_ref, b_resolver) = StructRef::promise();
        a_resolver.connect(&b_ref);
        b_resolver.connect(&a_ref);
        let err = b_ref.response().unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Protocol);
        // `a` was connected to `b`, so the refusal propagates rather than
        // deadlocking or looping.
        let err = a_ref.response().unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Protocol);
    }

    #[test]
    fn test_dropped_resolver_fails_promise() {
        let (struct_ref, resolver) = StructRef::promise();
        drop(resolver);
        let err = struct_ref.response().unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Failed);
    }

    #[tokio::test]
    async fn test_queued_calls_replay_in_order_on_resolution() {
        use crate::RpcTarget;
        use async_trait::async_trait;

        #[derive(Debug)]
        struct Recorder(Mutex<Vec<u16>>);

        #[async_trait]
        impl RpcTarget for Recorder {
            async fn call(
                &self,
                method: MethodId,
                _params: Payload,
            ) -> Result<Payload, RpcError> {
                self.0.lock().unwrap().push(method.method_id);
                Ok(Payload::empty())
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let target = Cap::local(recorder.clone());

        let (struct_ref, resolver) = StructRef::promise();
        let pipelined = struct_ref.get_pipelined(&[0]);
        let mut results = Vec::new();
        for i in 0..4 {
            results.push(pipelined.call(MethodId::new(1, i), Payload::empty()));
        }

        resolver.resolve(Ok(Payload::new(
            json!([cap_marker(0)]),
            vec![target.clone()],
        )));

        for result in &results {
            result.await_resolved().await.unwrap();
        }
        assert_eq!(*recorder.0.lock().unwrap(), (0..4).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pipelined_cap_after_error_resolution_is_broken() {
        let (struct_ref, resolver) = StructRef::promise();
        let pipelined = struct_ref.get_pipelined(&[0]);
        resolver.resolve(Err(RpcError::failed("upstream died")));

        let err = pipelined
            .call(MethodId::new(1, 0), Payload::empty())
            .await_resolved()
            .await
            .unwrap_err();
        assert_eq!(err.message, "upstream died");

        // Post-resolution lookups shorten straight to the broken cap.
        let late = struct_ref.get_pipelined(&[9]);
        let err = late
            .call(MethodId::new(1, 0), Payload::empty())
            .await_resolved()
            .await
            .unwrap_err();
        assert_eq!(err.message, "upstream died");
    }

    #[test]
    fn test_shortest_collapses_resolved_chain() {
        let end = Cap::null();
        let middle = PromiseCapHook::pending_local();
        let outer = PromiseCapHook::pending_local();

        let middle_cap = Cap::from_hook(middle.clone());
        let outer_cap = Cap::from_hook(outer.clone());

        middle.resolve(end.clone());
        outer.resolve(middle_cap);

        assert!(outer_cap.shortest().eq_identity(&end));
        // Idempotent: shortening a shortened cap is a no-op.
        let short = outer_cap.shortest();
        assert!(short.shortest().eq_identity(&short));
    }
}
