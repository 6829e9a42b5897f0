use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The call raised an application-level exception.
    Failed,
    /// The call was terminated by cancellation.
    Canceled,
    /// The peer violated the protocol; fatal to the whole session.
    Protocol,
    /// The connection is gone.
    Disconnected,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Failed => "failed",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Failed, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Disconnected, message)
    }

    /// Whether this error must tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        self.code == ErrorCode::Protocol
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::protocol(format!("JSON error: {}", err))
    }
}
