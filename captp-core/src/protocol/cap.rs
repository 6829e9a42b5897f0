// The polymorphic capability value. A Cap is a cheap handle; cloning it is
// the ref-count increment, dropping the last clone is the release.

use crate::error::RpcError;
use crate::ids::{ConnectionId, ImportId, QuestionId};
use crate::protocol::message::{cap_index_at, MethodId, PipelinePath};
use crate::protocol::promise::{StructRef, StructResolver};
use crate::RpcTarget;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A call payload on the user side of the boundary: opaque content plus the
/// live capabilities it references. `{"$cap": n}` in `content` points at
/// `caps[n]`.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub content: Value,
    pub caps: Vec<Cap>,
}

impl Payload {
    pub fn new(content: Value, caps: Vec<Cap>) -> Self {
        Payload { content, caps }
    }

    pub fn empty() -> Self {
        Payload {
            content: Value::Null,
            caps: Vec::new(),
        }
    }

    /// A payload whose whole content is one capability.
    pub fn single_cap(cap: Cap) -> Self {
        Payload {
            content: crate::protocol::message::cap_marker(0),
            caps: vec![cap],
        }
    }

    /// The capability a pipeline path addresses.
    pub fn cap_at(&self, path: &[u16]) -> Result<Cap, RpcError> {
        let index = cap_index_at(&self.content, path)?;
        self.caps
            .get(index)
            .cloned()
            .ok_or_else(|| RpcError::failed(format!("capability index {} is out of range", index)))
    }
}

/// What a hook is, for descriptor translation and shortening.
#[derive(Debug, Clone)]
pub(crate) enum HookKind {
    /// An in-process service.
    Local,
    /// A permanently failed capability.
    Broken,
    /// An unresolved local promise with no remote identity.
    Promise,
    /// A proxy for a capability the peer of `conn` hosts.
    Import { conn: ConnectionId, id: ImportId },
    /// An unresolved pipelined cap on one of `conn`'s questions.
    PipelinedAnswer {
        conn: ConnectionId,
        question: QuestionId,
        path: PipelinePath,
    },
}

/// Behavior behind a capability handle.
pub(crate) trait CapHook: Send + Sync + fmt::Debug {
    fn call(&self, method: MethodId, params: Payload) -> StructRef;

    /// For promise hooks: the capability this one has resolved to.
    fn resolved(&self) -> Option<Cap>;

    fn kind(&self) -> HookKind;
}

/// A reference to an object: local, remote, or promised.
#[derive(Clone)]
pub struct Cap {
    hook: Arc<dyn CapHook>,
}

impl fmt::Debug for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap({:?})", self.hook)
    }
}

impl Cap {
    pub(crate) fn from_hook(hook: Arc<dyn CapHook>) -> Self {
        Cap { hook }
    }

    /// Wrap an in-process service. Must be called within a tokio runtime;
    /// deliveries run on a per-cap queue so call order is preserved.
    pub fn local(target: Arc<dyn RpcTarget>) -> Self {
        Cap::from_hook(Arc::new(LocalHook::new(target)))
    }

    /// The null capability: every call fails.
    pub fn null() -> Self {
        Cap::broken(RpcError::failed("null capability"))
    }

    /// A capability that fails every call with `error`.
    pub fn broken(error: RpcError) -> Self {
        Cap::from_hook(Arc::new(BrokenHook { error }))
    }

    pub fn call(&self, method: MethodId, params: Payload) -> StructRef {
        self.hook.call(method, params)
    }

    /// The most direct representation known: follows resolved promise hops.
    /// Chains are bounded; a chain that never bottoms out is broken off.
    pub fn shortest(&self) -> Cap {
        let mut current = self.clone();
        for _ in 0..MAX_RESOLUTION_HOPS {
            match current.hook.resolved() {
                Some(next) => current = next,
                None => return current,
            }
        }
        Cap::broken(RpcError::protocol(
            "capability resolution chain does not terminate",
        ))
    }

    /// Pointer identity of the underlying object. Two handles to the same
    /// object compare equal even after a round trip over the wire.
    pub fn eq_identity(&self, other: &Cap) -> bool {
        self.identity() == other.identity()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.hook) as *const () as usize
    }

    pub(crate) fn kind(&self) -> HookKind {
        self.hook.kind()
    }
}

const MAX_RESOLUTION_HOPS: usize = 64;

struct Delivery {
    method: MethodId,
    params: Payload,
    resolver: StructResolver,
}

/// An in-process service. Deliveries funnel through one queue per handle so
/// messages to the same capability keep their send order.
struct LocalHook {
    target: Arc<dyn RpcTarget>,
    queue: mpsc::UnboundedSender<Delivery>,
}

impl LocalHook {
    fn new(target: Arc<dyn RpcTarget>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let worker_target = target.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let result = worker_target
                    .call(delivery.method, delivery.params)
                    .await;
                delivery.resolver.resolve(result);
            }
        });
        LocalHook { target, queue }
    }
}

impl fmt::Debug for LocalHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalHook({:?})", self.target)
    }
}

impl CapHook for LocalHook {
    fn call(&self, method: MethodId, params: Payload) -> StructRef {
        let (struct_ref, resolver) = StructRef::promise();
        debug!(method = %method, "delivering local call");
        if self
            .queue
            .send(Delivery {
                method,
                params,
                resolver,
            })
            .is_err()
        {
            // The worker only exits once every handle is gone, so this is
            // unreachable in practice; fail the call rather than panic.
            return StructRef::resolved(Err(RpcError::failed("service worker is gone")));
        }
        struct_ref
    }

    fn resolved(&self) -> Option<Cap> {
        None
    }

    fn kind(&self) -> HookKind {
        HookKind::Local
    }
}

#[derive(Debug)]
struct BrokenHook {
    error: RpcError,
}

impl CapHook for BrokenHook {
    fn call(&self, _method: MethodId, _params: Payload) -> StructRef {
        StructRef::resolved(Err(self.error.clone()))
    }

    fn resolved(&self) -> Option<Cap> {
        None
    }

    fn kind(&self) -> HookKind {
        HookKind::Broken
    }
}
