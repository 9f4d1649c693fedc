//! Chakrator core types: resource events, log records and the seams the
//! runtime crates share (log sink, status writer).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod log;

pub use log::{LogLevel, LogRecord, LogSink, MemorySink, NullSink, SEPARATOR};

/// Reconciler source used when nothing has been stored yet.
pub const DEFAULT_RECONCILER: &str = include_str!("../templates/reconciler.rhai");

/// Name of the single function a loaded unit must expose.
pub const ENTRY_POINT: &str = "reconcile";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "ADDED",
            EventKind::Modified => "MODIFIED",
            EventKind::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "added" => Ok(EventKind::Added),
            "modified" => Ok(EventKind::Modified),
            "deleted" => Ok(EventKind::Deleted),
            other => Err(anyhow::anyhow!("unknown event kind: {} (expect added|modified|deleted)", other)),
        }
    }
}

/// Object metadata. Fields the runtime looks at are typed; everything else
/// (labels, annotations, resourceVersion, ...) rides along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A watched custom resource. `spec` and `status` are opaque to the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl ResourceObject {
    pub fn from_value(v: Value) -> serde_json::Result<Self> { serde_json::from_value(v) }

    pub fn to_value(&self) -> serde_json::Result<Value> { serde_json::to_value(self) }

    pub fn name(&self) -> &str {
        if self.metadata.name.is_empty() { "unknown" } else { &self.metadata.name }
    }

    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("default") }

    /// `namespace/name`, with the same fallbacks the log lines use.
    pub fn display_name(&self) -> String { format!("{}/{}", self.namespace(), self.name()) }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }
}

/// One resource lifecycle notification from the watch transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub object: ResourceObject,
}

impl ResourceEvent {
    pub fn new(kind: EventKind, object: ResourceObject) -> Self { Self { kind, object } }
    pub fn added(object: ResourceObject) -> Self { Self::new(EventKind::Added, object) }
    pub fn modified(object: ResourceObject) -> Self { Self::new(EventKind::Modified, object) }
    pub fn deleted(object: ResourceObject) -> Self { Self::new(EventKind::Deleted, object) }
}

/// Outcome of one reconciliation that did not load or did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    /// The entry point explicitly rejected the object.
    #[error("reconcile failure: {0}")]
    Failure(String),
    /// An unexpected error escaped the entry point.
    #[error("fault: {0}")]
    Fault(String),
}

/// Writes a requested status back to the cluster (or wherever the
/// reconciled objects live).
#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_status(&self, object: &ResourceObject, status: &Value) -> anyhow::Result<()>;
}

pub mod prelude {
    pub use super::{
        EventKind, LogLevel, LogRecord, LogSink, ObjectMeta, ReconcileError, ResourceEvent, ResourceObject,
        StatusWriter,
    };
}
