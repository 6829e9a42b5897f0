use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Question ID - our record of a call we sent.
/// The same number indexes the peer's answer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestionId(u32);

/// Answer ID - our record of a call the peer sent.
/// The same number indexes the peer's question table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnswerId(u32);

/// Export ID - an entry in our export table, allocated by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(u32);

/// Import ID - an entry in our import table, allocated by the peer
/// (it is the peer's export ID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(u32);

/// Embargo ID - identifies a pending loopback disembargo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbargoId(u32);

impl QuestionId {
    pub fn new(value: u32) -> Self {
        QuestionId(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The answer ID the receiver of our call files this question under.
    pub fn as_answer(&self) -> AnswerId {
        AnswerId(self.0)
    }
}

impl AnswerId {
    pub fn new(value: u32) -> Self {
        AnswerId(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The question ID the peer knows this answer by.
    pub fn as_question(&self) -> QuestionId {
        QuestionId(self.0)
    }
}

impl ExportId {
    pub fn new(value: u32) -> Self {
        ExportId(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The import ID the peer files this export under.
    pub fn as_import(&self) -> ImportId {
        ImportId(self.0)
    }
}

impl ImportId {
    pub fn new(value: u32) -> Self {
        ImportId(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The export ID the peer knows this import by.
    pub fn as_export(&self) -> ExportId {
        ExportId(self.0)
    }
}

impl EmbargoId {
    pub fn new(value: u32) -> Self {
        EmbargoId(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Question#{}", self.0)
    }
}

impl fmt::Display for AnswerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Answer#{}", self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Export#{}", self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Import#{}", self.0)
    }
}

impl fmt::Display for EmbargoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Embargo#{}", self.0)
    }
}

/// Process-unique identity of a live connection. Capability handles carry
/// this so descriptor translation can tell "our" proxies from foreign ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn#{}", self.0)
    }
}
