// The four-table CapTP state machine. Inputs are semantic events, outputs
// are semantic frames collected into a queue the session drains; nothing in
// here suspends. Deferred work that must run outside the table lock (promise
// resolutions, call dispatch, queue replays) comes back as PostActions.

use crate::error::RpcError;
use crate::ids::{AnswerId, EmbargoId, ExportId, ImportId, QuestionId};
use crate::protocol::cap::{Cap, HookKind, Payload};
use crate::protocol::message::{
    cap_index_at, CapDescriptor, DisembargoContext, Message, MessageTarget, MethodId,
    PipelinePath, ReturnKind, WirePayload,
};
use crate::protocol::promise::{
    new_promise, CancelGuard, PromiseCapHook, QueuedCall, StructRef, StructResolver,
};
use crate::protocol::session::{Command, ConnInner, ImportHook};
use crate::protocol::table::{AllocTable, TrackTable};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Work the session must run after releasing the table lock: resolutions and
/// dispatches re-enter capability code, which may call back into the engine.
pub(crate) enum PostAction {
    Resolve {
        resolver: StructResolver,
        result: Result<Payload, RpcError>,
    },
    ResolveAnswer {
        answer: AnswerId,
        answer_ref: StructRef,
        resolver: StructResolver,
        result: Result<Payload, RpcError>,
    },
    DispatchCall {
        answer: AnswerId,
        answer_ref: StructRef,
        resolver: StructResolver,
        target: Cap,
        method: MethodId,
        params: Payload,
    },
    Replay {
        target: Cap,
        calls: Vec<QueuedCall>,
    },
}

/// A call we sent. Lives from Call emission until return received and
/// Finish sent.
struct Question {
    resolver: Option<StructResolver>,
    finish_sent: bool,
    return_received: bool,
    cancelled: bool,
    /// Paths with pipelined calls in flight; drives embargo promotion.
    pipelined_paths: HashSet<PipelinePath>,
    /// Exports counted when the call's params went out.
    param_exports: Vec<ExportId>,
}

/// A call the peer sent. Lives from Call receipt until Return sent and
/// Finish received.
struct Answer {
    struct_ref: StructRef,
    finished: bool,
    return_sent: bool,
    /// Exports counted when the return went out, for releaseResultCaps.
    result_exports: Vec<ExportId>,
}

/// A capability we published. `wire_refs` counts the references the peer
/// believes it holds.
struct Export {
    cap: Cap,
    wire_refs: u32,
}

/// A capability the peer published. The proxy is weak: dropping the last
/// user handle is what triggers Release.
struct Import {
    proxy: Weak<ImportHook>,
    remote_refs: u32,
}

/// A loopback cap waiting for its disembargo echo.
struct Embargo {
    hook: Arc<PromiseCapHook>,
    target: Cap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStats {
    pub questions: usize,
    pub answers: usize,
    pub exports: usize,
    pub imports: usize,
    pub embargoes: usize,
}

pub(crate) struct Engine {
    questions: AllocTable<QuestionId, Question>,
    answers: TrackTable<AnswerId, Answer>,
    exports: AllocTable<ExportId, Export>,
    /// Hook pointer -> export id, so a round-tripped cap reuses its slot.
    exports_by_identity: HashMap<usize, ExportId>,
    imports: TrackTable<ImportId, Import>,
    embargoes: AllocTable<EmbargoId, Embargo>,
    /// Frames awaiting the session's flush, in emission order.
    frames: Vec<Message>,
    /// Entries removed while the table lock is held. Dropping a capability
    /// can cascade into promise resolutions that re-enter the engine, so
    /// the session drops these only after unlocking.
    limbo: Vec<Box<dyn Send>>,
    dead: Option<RpcError>,
}

impl Engine {
    pub(crate) fn new() -> Self {
        Engine {
            questions: AllocTable::new(),
            answers: TrackTable::new(),
            exports: AllocTable::new(),
            exports_by_identity: HashMap::new(),
            imports: TrackTable::new(),
            embargoes: AllocTable::new(),
            frames: Vec::new(),
            limbo: Vec::new(),
            dead: None,
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    pub(crate) fn dead_error(&self) -> Option<RpcError> {
        self.dead.clone()
    }

    pub(crate) fn take_frames(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.frames)
    }

    pub(crate) fn push_frame(&mut self, frame: Message) {
        self.frames.push(frame);
    }

    pub(crate) fn take_limbo(&mut self) -> Vec<Box<dyn Send>> {
        std::mem::take(&mut self.limbo)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            questions: self.questions.len(),
            answers: self.answers.len(),
            exports: self.exports.len(),
            imports: self.imports.len(),
            embargoes: self.embargoes.len(),
        }
    }

    // ---- outbound operations --------------------------------------------

    /// Allocate a question wired for pipelining and cancellation.
    fn new_question(&mut self, conn: &Arc<ConnInner>) -> (StructRef, QuestionId) {
        let mut struct_ref = None;
        let qid = self.questions.alloc(|qid| {
            let cmd = conn.cmd_sender();
            let guard = Arc::new(CancelGuard::new(Box::new(move || {
                let _ = cmd.send(Command::DropQuestion(qid));
            })));
            let ops = conn.new_question_pipeline(qid, &guard);
            let (sr, resolver) = new_promise(Some(ops), Some(guard));
            struct_ref = Some(sr);
            Question {
                resolver: Some(resolver),
                finish_sent: false,
                return_received: false,
                cancelled: false,
                pipelined_paths: HashSet::new(),
                param_exports: Vec::new(),
            }
        });
        let struct_ref = struct_ref.expect("alloc always runs its builder");
        (struct_ref, qid)
    }

    pub(crate) fn send_bootstrap(&mut self, conn: &Arc<ConnInner>) -> StructRef {
        if let Some(err) = &self.dead {
            return StructRef::resolved(Err(err.clone()));
        }
        let (struct_ref, qid) = self.new_question(conn);
        self.frames.push(Message::Bootstrap { question_id: qid });
        debug!(question = %qid, "bootstrap requested");
        struct_ref
    }

    pub(crate) fn send_call(
        &mut self,
        conn: &Arc<ConnInner>,
        target: MessageTarget,
        method: MethodId,
        params: Payload,
    ) -> StructRef {
        if let Some(err) = &self.dead {
            return StructRef::resolved(Err(err.clone()));
        }
        let (struct_ref, qid) = self.new_question(conn);
        let (wire_params, param_exports) = self.send_payload(conn, &params);
        if let Some(q) = self.questions.find_mut(qid) {
            q.param_exports = param_exports;
        }
        if let MessageTarget::PromisedAnswer {
            question_id,
            transform,
        } = &target
        {
            // Remember the path so the return can embargo it if it loops back.
            if let Some(q) = self.questions.find_mut(*question_id) {
                q.pipelined_paths.insert(transform.clone());
            }
        }
        debug!(question = %qid, method = %method, "call sent");
        self.frames.push(Message::Call {
            question_id: qid,
            target,
            method,
            params: wire_params,
        });
        struct_ref
    }

    /// A pipelined call riding on `qid`. `Err` hands the params back when
    /// the question has already settled.
    pub(crate) fn call_pipelined(
        &mut self,
        conn: &Arc<ConnInner>,
        qid: QuestionId,
        path: &[u16],
        method: MethodId,
        params: Payload,
    ) -> Result<StructRef, Payload> {
        if let Some(err) = &self.dead {
            return Ok(StructRef::resolved(Err(err.clone())));
        }
        match self.questions.find(qid) {
            Some(q) if !q.return_received => {}
            _ => return Err(params),
        }
        Ok(self.send_call(
            conn,
            MessageTarget::PromisedAnswer {
                question_id: qid,
                transform: path.to_vec(),
            },
            method,
            params,
        ))
    }

    /// The caller dropped its last handle on a question's result.
    pub(crate) fn drop_question(&mut self, qid: QuestionId) {
        if self.dead.is_some() {
            return;
        }
        let q = match self.questions.find_mut(qid) {
            Some(q) => q,
            None => return,
        };
        if !q.finish_sent {
            q.finish_sent = true;
            q.cancelled = true;
            debug!(question = %qid, "question canceled by caller");
            self.frames.push(Message::Finish {
                question_id: qid,
                release_result_caps: true,
            });
        }
        // The slot survives until the Return arrives and is swallowed.
    }

    /// The last local handle on an import proxy dropped.
    pub(crate) fn release_import(&mut self, id: ImportId) {
        if self.dead.is_some() {
            return;
        }
        let count = {
            let entry = match self.imports.find_mut(id) {
                Some(entry) => entry,
                None => return,
            };
            if entry.proxy.upgrade().is_some() {
                // A fresh proxy was installed for this id after the old one
                // died; its own drop will carry the whole count.
                return;
            }
            entry.remote_refs
        };
        self.imports.release(id);
        debug!(import = %id, count, "import released");
        self.frames.push(Message::Release {
            id,
            reference_count: count,
        });
    }

    // ---- inbound operations ---------------------------------------------

    pub(crate) fn handle_bootstrap(
        &mut self,
        conn: &Arc<ConnInner>,
        question_id: QuestionId,
    ) -> Result<Vec<PostAction>, RpcError> {
        let aid = question_id.as_answer();
        let (struct_ref, resolver) = StructRef::promise();
        self.answers.set(
            aid,
            Answer {
                struct_ref: struct_ref.clone(),
                finished: false,
                return_sent: false,
                result_exports: Vec::new(),
            },
        )?;
        debug!(answer = %aid, "bootstrap received");
        let result = match conn.bootstrap_cap() {
            Some(cap) => Ok(Payload::single_cap(cap)),
            None => Err(RpcError::failed("no bootstrap capability is configured")),
        };
        Ok(vec![PostAction::ResolveAnswer {
            answer: aid,
            answer_ref: struct_ref,
            resolver,
            result,
        }])
    }

    pub(crate) fn handle_call(
        &mut self,
        conn: &Arc<ConnInner>,
        question_id: QuestionId,
        target: MessageTarget,
        method: MethodId,
        params: WirePayload,
    ) -> Result<Vec<PostAction>, RpcError> {
        let aid = question_id.as_answer();
        let target_cap = self.resolve_target(conn, &target)?;
        let params = self.recv_payload(conn, params)?;
        let (struct_ref, resolver) = StructRef::promise();
        self.answers.set(
            aid,
            Answer {
                struct_ref: struct_ref.clone(),
                finished: false,
                return_sent: false,
                result_exports: Vec::new(),
            },
        )?;
        debug!(answer = %aid, method = %method, "call received");
        Ok(vec![PostAction::DispatchCall {
            answer: aid,
            answer_ref: struct_ref,
            resolver,
            target: target_cap,
            method,
            params,
        }])
    }

    pub(crate) fn handle_return(
        &mut self,
        conn: &Arc<ConnInner>,
        answer_id: AnswerId,
        release_param_caps: bool,
        kind: ReturnKind,
    ) -> Result<Vec<PostAction>, RpcError> {
        let qid = answer_id.as_question();
        let (cancelled, paths, param_exports) = {
            let q = self.questions.find_expect(qid)?;
            if q.return_received {
                return Err(RpcError::protocol(format!("{} already returned", qid)));
            }
            q.return_received = true;
            (
                q.cancelled,
                std::mem::take(&mut q.pipelined_paths),
                std::mem::take(&mut q.param_exports),
            )
        };
        if release_param_caps {
            for id in param_exports {
                self.release_export(id, 1)?;
            }
        }

        let mut actions = Vec::new();
        let result = if cancelled {
            // We already sent Finish with releaseResultCaps; whatever came
            // back must not materialize imports on our side.
            Err(RpcError::canceled("call canceled"))
        } else {
            match kind {
                ReturnKind::Results { payload } => {
                    Ok(self.recv_results(conn, qid, &paths, payload)?)
                }
                ReturnKind::Exception { error } => Err(RpcError::failed(error.message)),
                ReturnKind::Canceled => Err(RpcError::canceled("call canceled by peer")),
            }
        };

        // Transition the question's pipelined caps while the tables are
        // still locked, so no new pipelined send can slip in behind the
        // resolution. Their queues are normally empty (pipelined calls go
        // straight to the wire); anything queued replays outside the lock.
        let resolver = self.questions.find_expect(qid)?.resolver.take();
        if let Some(resolver) = resolver {
            for (path, hook) in resolver.take_pipeline() {
                let target = match &result {
                    Ok(payload) => match payload.cap_at(&path) {
                        Ok(cap) => cap.shortest(),
                        Err(e) => Cap::broken(e),
                    },
                    Err(e) => Cap::broken(e.clone()),
                };
                let queued = hook.resolve(target.clone());
                if !queued.is_empty() {
                    actions.push(PostAction::Replay {
                        target,
                        calls: queued,
                    });
                }
            }
            actions.push(PostAction::Resolve { resolver, result });
        }

        let finish_needed = {
            let q = self.questions.find_expect(qid)?;
            if q.finish_sent {
                false
            } else {
                q.finish_sent = true;
                true
            }
        };
        if finish_needed {
            self.frames.push(Message::Finish {
                question_id: qid,
                release_result_caps: false,
            });
        }
        self.questions.release(qid);
        debug!(question = %qid, "return received; question retired");
        Ok(actions)
    }

    pub(crate) fn handle_finish(
        &mut self,
        question_id: QuestionId,
        release_result_caps: bool,
    ) -> Result<(), RpcError> {
        let aid = question_id.as_answer();
        let (return_sent, result_exports) = {
            let ans = self.answers.find_expect(aid)?;
            if ans.finished {
                return Err(RpcError::protocol(format!("{} already finished", aid)));
            }
            ans.finished = true;
            let exports = if release_result_caps {
                std::mem::take(&mut ans.result_exports)
            } else {
                Vec::new()
            };
            (ans.return_sent, exports)
        };
        for id in result_exports {
            self.release_export(id, 1)?;
        }
        if return_sent {
            if let Some(answer) = self.answers.release(aid) {
                self.limbo.push(Box::new(answer));
            }
            debug!(answer = %aid, "answer retired");
        }
        Ok(())
    }

    pub(crate) fn handle_release(&mut self, id: ImportId, count: u32) -> Result<(), RpcError> {
        self.release_export(id.as_export(), count)
    }

    pub(crate) fn handle_disembargo(
        &mut self,
        conn: &Arc<ConnInner>,
        target: MessageTarget,
        context: DisembargoContext,
    ) -> Result<Vec<PostAction>, RpcError> {
        match context {
            DisembargoContext::SenderLoopback { id } => {
                let cap = self.resolve_target(conn, &target)?.shortest();
                match cap.kind() {
                    HookKind::Import {
                        conn: cap_conn,
                        id: import_id,
                    } if cap_conn == conn.id() => {
                        // Mirror it: by the time the peer sees this echo,
                        // every call we forwarded ahead of it has landed.
                        self.frames.push(Message::Disembargo {
                            target: MessageTarget::ImportedCap {
                                id: import_id.as_export(),
                            },
                            context: DisembargoContext::ReceiverLoopback { id },
                        });
                        Ok(Vec::new())
                    }
                    _ => Err(RpcError::protocol(
                        "senderLoopback disembargo does not land on a capability imported from the peer",
                    )),
                }
            }
            DisembargoContext::ReceiverLoopback { id } => {
                let embargo = self
                    .embargoes
                    .release(id)
                    .ok_or_else(|| RpcError::protocol(format!("{} is not pending", id)))?;
                debug!(embargo = %id, "disembargo echo received; queue released");
                let queued = embargo.hook.resolve(embargo.target.clone());
                Ok(vec![PostAction::Replay {
                    target: embargo.target,
                    calls: queued,
                }])
            }
        }
    }

    /// Emit the Return for a locally-dispatched answer once its promise has
    /// settled. Harmless if the answer has since been torn down.
    pub(crate) fn return_answer(
        &mut self,
        conn: &Arc<ConnInner>,
        aid: AnswerId,
    ) -> Result<(), RpcError> {
        if self.dead.is_some() {
            return Ok(());
        }
        let (finished, resolution) = {
            let ans = match self.answers.find_mut(aid) {
                Some(ans) => ans,
                None => return Ok(()),
            };
            if ans.return_sent {
                warn!(answer = %aid, "answer resolved twice; keeping the first return");
                return Ok(());
            }
            (ans.finished, ans.struct_ref.response())
        };
        let resolution = match resolution {
            Some(resolution) => resolution,
            None => {
                warn!(answer = %aid, "return requested for an unresolved answer");
                return Ok(());
            }
        };

        let (kind, result_exports) = if finished {
            // The caller finished first: it must not receive capabilities.
            (ReturnKind::Canceled, Vec::new())
        } else {
            match resolution {
                Ok(payload) => {
                    let (wire, exports) = self.send_payload(conn, &payload);
                    (ReturnKind::Results { payload: wire }, exports)
                }
                Err(e) if e.code == crate::error::ErrorCode::Canceled => {
                    (ReturnKind::Canceled, Vec::new())
                }
                Err(e) => (ReturnKind::Exception { error: e }, Vec::new()),
            }
        };

        if let Some(ans) = self.answers.find_mut(aid) {
            ans.return_sent = true;
            ans.result_exports = result_exports;
        }
        debug!(answer = %aid, "return sent");
        self.frames.push(Message::Return {
            answer_id: aid,
            release_param_caps: false,
            kind,
        });
        if finished {
            if let Some(answer) = self.answers.release(aid) {
                self.limbo.push(Box::new(answer));
            }
        }
        Ok(())
    }

    /// Kill the session: every outstanding question fails, every table
    /// empties, nothing further is accepted.
    pub(crate) fn teardown(&mut self, err: RpcError) -> Vec<PostAction> {
        if self.dead.is_some() {
            return Vec::new();
        }
        self.dead = Some(err.clone());
        let mut actions = Vec::new();
        for (_, question) in self.questions.drain() {
            if let Some(resolver) = question.resolver {
                for (_, hook) in resolver.take_pipeline() {
                    let target = Cap::broken(err.clone());
                    let queued = hook.resolve(target.clone());
                    if !queued.is_empty() {
                        actions.push(PostAction::Replay {
                            target,
                            calls: queued,
                        });
                    }
                }
                actions.push(PostAction::Resolve {
                    resolver,
                    result: Err(err.clone()),
                });
            }
        }
        for (_, answer) in self.answers.drain() {
            self.limbo.push(Box::new(answer));
        }
        self.imports.drain();
        for (_, export) in self.exports.drain() {
            self.limbo.push(Box::new(export));
        }
        self.exports_by_identity.clear();
        for (_, embargo) in self.embargoes.drain() {
            let target = Cap::broken(err.clone());
            let queued = embargo.hook.resolve(target.clone());
            actions.push(PostAction::Replay {
                target,
                calls: queued,
            });
            self.limbo.push(Box::new(embargo.target));
        }
        warn!(error = %err, "session torn down");
        actions
    }

    // ---- descriptor translation -----------------------------------------

    /// Translate an outbound payload, allocating or re-counting exports.
    /// Returns the export ids counted, one per descriptor occurrence.
    fn send_payload(
        &mut self,
        conn: &Arc<ConnInner>,
        payload: &Payload,
    ) -> (WirePayload, Vec<ExportId>) {
        let mut counted = Vec::new();
        let cap_table = payload
            .caps
            .iter()
            .map(|cap| self.send_cap(conn, cap, &mut counted))
            .collect();
        (
            WirePayload::new(payload.content.clone(), cap_table),
            counted,
        )
    }

    fn send_cap(
        &mut self,
        conn: &Arc<ConnInner>,
        cap: &Cap,
        counted: &mut Vec<ExportId>,
    ) -> CapDescriptor {
        let short = cap.shortest();
        match short.kind() {
            HookKind::Import {
                conn: cap_conn,
                id,
            } if cap_conn == conn.id() => {
                // Round trip: hand the peer its own capability back.
                CapDescriptor::ReceiverHosted { id }
            }
            HookKind::PipelinedAnswer {
                conn: cap_conn,
                question,
                path,
            } if cap_conn == conn.id() => CapDescriptor::ReceiverAnswer {
                question_id: question,
                transform: path,
            },
            HookKind::Local | HookKind::Broken | HookKind::Import { .. } => {
                let id = self.export(&short);
                counted.push(id);
                CapDescriptor::SenderHosted { id }
            }
            HookKind::Promise | HookKind::PipelinedAnswer { .. } => {
                let id = self.export(&short);
                counted.push(id);
                CapDescriptor::SenderPromise { id }
            }
        }
    }

    fn export(&mut self, cap: &Cap) -> ExportId {
        let key = cap.identity();
        if let Some(&id) = self.exports_by_identity.get(&key) {
            if let Some(export) = self.exports.find_mut(id) {
                export.wire_refs += 1;
                return id;
            }
        }
        let id = self.exports.alloc(|_| Export {
            cap: cap.clone(),
            wire_refs: 1,
        });
        self.exports_by_identity.insert(key, id);
        debug!(export = %id, "capability exported");
        id
    }

    fn release_export(&mut self, id: ExportId, count: u32) -> Result<(), RpcError> {
        let remaining = {
            let export = self.exports.find_expect(id)?;
            if count > export.wire_refs {
                return Err(RpcError::protocol(format!(
                    "{} released {} refs but only {} are outstanding",
                    id, count, export.wire_refs
                )));
            }
            export.wire_refs -= count;
            export.wire_refs
        };
        if remaining == 0 {
            if let Some(export) = self.exports.release(id) {
                self.exports_by_identity.remove(&export.cap.identity());
                self.limbo.push(Box::new(export));
            }
            debug!(export = %id, "export retired");
        }
        Ok(())
    }

    /// Translate an inbound payload (params; no embargo promotion).
    fn recv_payload(
        &mut self,
        conn: &Arc<ConnInner>,
        wire: WirePayload,
    ) -> Result<Payload, RpcError> {
        let mut caps = Vec::with_capacity(wire.cap_table.len());
        for desc in &wire.cap_table {
            caps.push(self.recv_cap(conn, desc)?);
        }
        Ok(Payload::new(wire.content, caps))
    }

    /// Translate a return payload. Descriptors naming caps we host, on a
    /// path with pipelined calls still in flight, come back wrapped in an
    /// embargo cap and a Disembargo request goes out.
    fn recv_results(
        &mut self,
        conn: &Arc<ConnInner>,
        qid: QuestionId,
        pipelined_paths: &HashSet<PipelinePath>,
        wire: WirePayload,
    ) -> Result<Payload, RpcError> {
        let mut loopback: HashMap<usize, PipelinePath> = HashMap::new();
        for path in pipelined_paths {
            if let Ok(index) = cap_index_at(&wire.content, path) {
                loopback.entry(index).or_insert_with(|| path.clone());
            }
        }

        let mut caps = Vec::with_capacity(wire.cap_table.len());
        for (index, desc) in wire.cap_table.iter().enumerate() {
            let cap = self.recv_cap(conn, desc)?;
            let hosted_here = matches!(desc, CapDescriptor::ReceiverHosted { .. });
            let cap = match loopback.get(&index) {
                Some(path) if hosted_here => {
                    // Calls we pipelined at this path are still in flight
                    // over the wire; queue everything behind an embargo
                    // until the peer's echo confirms they have all landed.
                    let hook = PromiseCapHook::pending_local();
                    let wrapped = Cap::from_hook(hook.clone());
                    let eid = self.embargoes.alloc(|_| Embargo {
                        hook,
                        target: cap,
                    });
                    debug!(embargo = %eid, question = %qid, "loopback result embargoed");
                    self.frames.push(Message::Disembargo {
                        target: MessageTarget::PromisedAnswer {
                            question_id: qid,
                            transform: path.clone(),
                        },
                        context: DisembargoContext::SenderLoopback { id: eid },
                    });
                    wrapped
                }
                _ => cap,
            };
            caps.push(cap);
        }
        Ok(Payload::new(wire.content, caps))
    }

    fn recv_cap(&mut self, conn: &Arc<ConnInner>, desc: &CapDescriptor) -> Result<Cap, RpcError> {
        match desc {
            CapDescriptor::None => Ok(Cap::null()),
            CapDescriptor::SenderHosted { id } | CapDescriptor::SenderPromise { id } => {
                Ok(self.import(conn, id.as_import()))
            }
            CapDescriptor::ReceiverHosted { id } => {
                let eid = id.as_export();
                self.exports
                    .find(eid)
                    .map(|export| export.cap.clone())
                    .ok_or_else(|| {
                        RpcError::protocol(format!("{} does not name a live export", eid))
                    })
            }
            CapDescriptor::ReceiverAnswer {
                question_id,
                transform,
            } => self.answer_cap(question_id.as_answer(), transform),
            CapDescriptor::ThirdPartyHosted => Err(RpcError::protocol(
                "thirdPartyHosted capabilities are not supported (level 3)",
            )),
        }
    }

    /// One proxy per import id: repeated descriptors bump the ref we owe
    /// the peer and reuse the live hook.
    fn import(&mut self, conn: &Arc<ConnInner>, id: ImportId) -> Cap {
        if let Some(entry) = self.imports.find_mut(id) {
            entry.remote_refs += 1;
            if let Some(hook) = entry.proxy.upgrade() {
                return Cap::from_hook(hook);
            }
            // The old proxy died and its release command is still in
            // flight; install a fresh hook on the same entry. The stale
            // command sees a live proxy and backs off.
            let hook = conn.new_import_hook(id);
            entry.proxy = Arc::downgrade(&hook);
            return Cap::from_hook(hook);
        }
        let hook = conn.new_import_hook(id);
        debug!(import = %id, "capability imported");
        let _ = self.imports.set(
            id,
            Import {
                proxy: Arc::downgrade(&hook),
                remote_refs: 1,
            },
        );
        Cap::from_hook(hook)
    }

    fn resolve_target(
        &mut self,
        _conn: &Arc<ConnInner>,
        target: &MessageTarget,
    ) -> Result<Cap, RpcError> {
        match target {
            MessageTarget::ImportedCap { id } => self
                .exports
                .find(*id)
                .map(|export| export.cap.clone())
                .ok_or_else(|| RpcError::protocol(format!("{} does not name a live export", id))),
            MessageTarget::PromisedAnswer {
                question_id,
                transform,
            } => self.answer_cap(question_id.as_answer(), transform),
        }
    }

    /// The capability an answer exposes at `path`: concrete if resolved,
    /// a queueing promise cap otherwise.
    fn answer_cap(&mut self, aid: AnswerId, path: &[u16]) -> Result<Cap, RpcError> {
        let answer = self
            .answers
            .find(aid)
            .ok_or_else(|| RpcError::protocol(format!("{} does not name a live answer", aid)))?;
        Ok(answer.struct_ref.get_pipelined(path))
    }
}
