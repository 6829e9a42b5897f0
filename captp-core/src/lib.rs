pub mod codec;
pub mod error;
pub mod ids;
pub mod transport;

pub mod protocol;

pub use error::{ErrorCode, RpcError};
pub use ids::{AnswerId, EmbargoId, ExportId, ImportId, QuestionId};

pub use protocol::{
    cap::{Cap, Payload},
    message::{
        cap_index_at, cap_marker, CapDescriptor, DisembargoContext, Message, MessageTarget,
        MethodId, PipelinePath, ReturnKind, WirePayload,
    },
    promise::{StructRef, StructResolver},
    session::{Connection, ConnectionOptions, ConnectionStats},
};

pub use codec::{decode_message, encode_frame, encode_message, FrameFormat};
pub use transport::{RpcTransport, TransportError, TransportRx, TransportTx};

pub use async_trait::async_trait;

/// An in-process service reachable through a capability.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Handle one method call. Capabilities in `params` are owned by the
    /// callee; capabilities in the result transfer to the caller.
    async fn call(&self, method: MethodId, params: Payload) -> Result<Payload, RpcError>;
}
