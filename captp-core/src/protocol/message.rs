// Level-1 CapTP frame set, pre-serialization.
// The session layer owns how these get onto a byte stream (see codec).

use crate::error::RpcError;
use crate::ids::{AnswerId, EmbargoId, ExportId, ImportId, QuestionId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A pipeline path: field indices into a call result, outermost first.
pub type PipelinePath = Vec<u16>;

/// Method identity: `(interface_id, method_id)` per the schema convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId {
    pub interface_id: u64,
    pub method_id: u16,
}

impl MethodId {
    pub fn new(interface_id: u64, method_id: u16) -> Self {
        MethodId {
            interface_id,
            method_id,
        }
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}.{}", self.interface_id, self.method_id)
    }
}

/// The object a call or disembargo is aimed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageTarget {
    /// A capability in the receiver's export table (the sender imported it).
    ImportedCap { id: ExportId },
    /// The not-yet-returned result of an earlier call, plus a path into it.
    PromisedAnswer {
        question_id: QuestionId,
        transform: PipelinePath,
    },
}

/// How a capability is described on the wire. "Sender" and "receiver" are
/// relative to the message carrying the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CapDescriptor {
    None,
    SenderHosted { id: ExportId },
    SenderPromise { id: ExportId },
    ReceiverHosted { id: ImportId },
    ReceiverAnswer {
        question_id: QuestionId,
        transform: PipelinePath,
    },
    /// Level 3; recognized so the codec round-trips it, rejected on receipt.
    ThirdPartyHosted,
}

/// Payload as it travels: opaque content plus a capability table.
/// Inside `content`, `{"$cap": n}` references `cap_table[n]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub content: Value,
    pub cap_table: Vec<CapDescriptor>,
}

impl WirePayload {
    pub fn new(content: Value, cap_table: Vec<CapDescriptor>) -> Self {
        WirePayload { content, cap_table }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReturnKind {
    Results { payload: WirePayload },
    Exception { error: RpcError },
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "context", rename_all = "camelCase")]
pub enum DisembargoContext {
    /// The sender noticed a loopback and asks for an echo.
    SenderLoopback { id: EmbargoId },
    /// The echo: the receiver of the original request reflects the id back.
    ReceiverLoopback { id: EmbargoId },
}

/// The Level-1 frame set. IDs are written from the sender's perspective;
/// the receiver flips them (our question is its answer, and so on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Bootstrap {
        question_id: QuestionId,
    },
    Call {
        question_id: QuestionId,
        target: MessageTarget,
        method: MethodId,
        params: WirePayload,
    },
    Return {
        answer_id: AnswerId,
        release_param_caps: bool,
        #[serde(flatten)]
        kind: ReturnKind,
    },
    Finish {
        question_id: QuestionId,
        release_result_caps: bool,
    },
    Release {
        id: ImportId,
        reference_count: u32,
    },
    Disembargo {
        target: MessageTarget,
        #[serde(flatten)]
        context: DisembargoContext,
    },
    /// Sent once before closing when the sender hit a protocol-fatal error.
    Abort {
        error: RpcError,
    },
}

/// Build the content marker for capability `index` of the cap table.
pub fn cap_marker(index: usize) -> Value {
    json!({ "$cap": index })
}

/// If `value` is a capability marker, its cap-table index.
pub fn as_cap_marker(value: &Value) -> Option<usize> {
    value
        .as_object()
        .filter(|obj| obj.len() == 1)
        .and_then(|obj| obj.get("$cap"))
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
}

/// Walk a pipeline path through `content` and return the cap-table index it
/// lands on. Each step indexes an array element; the empty path addresses
/// the root.
pub fn cap_index_at(content: &Value, path: &[u16]) -> Result<usize, RpcError> {
    let mut cursor = content;
    for &step in path {
        match cursor {
            Value::Array(items) => {
                cursor = items.get(step as usize).ok_or_else(|| {
                    RpcError::failed(format!("pipeline step {} is out of range", step))
                })?;
            }
            _ => {
                return Err(RpcError::failed(format!(
                    "pipeline step {} does not address an array",
                    step
                )))
            }
        }
    }
    as_cap_marker(cursor)
        .ok_or_else(|| RpcError::failed("pipeline path does not address a capability"))
}
