//! The capability set consumed from the external coordination service.
//!
//! Only the primitives the election protocol needs are modelled: node
//! creation (optionally ephemeral and/or sequential), data reads, existence
//! checks and child listings with one-shot watches, updates and deletes.
//! Watch notifications are delivered as [`WatchedEvent`]s over an unbounded
//! channel so that the consumer can process them from a single task.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{Fault, FaultKind, InMemoryClient, InMemoryCoordinationService, Operation};

/// Identifier of a client session. Ephemeral nodes live as long as the
/// session that created them.
pub type SessionId = i64;

/// Receiving end of watch notifications. The same sender may arm watches on
/// several paths; the service delivers at most one event per armed watch.
pub type Watcher = mpsc::UnboundedSender<WatchedEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Session state change; carries no path and is not a data change.
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: SessionState,
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: SessionState::Connected,
            path: Some(path.into()),
        }
    }

    pub fn session(state: SessionState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    pub fn is_session_event(&self) -> bool {
        self.event_type == EventType::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub version: i32,
    pub num_children: usize,
    pub ephemeral_owner: Option<SessionId>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("No node at {0}")]
    NoNode(String),

    #[error("Node already exists at {0}")]
    NodeExists(String),

    #[error("Node {0} still has children")]
    NotEmpty(String),

    #[error("Ephemeral node {0} cannot have children")]
    NoChildrenForEphemerals(String),

    #[error("Connection to the coordination service was lost")]
    ConnectionLoss,

    #[error("Session {0} has expired")]
    SessionExpired(SessionId),

    #[error("Client is closed")]
    Closed,
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// A connection to a hierarchical coordination service.
///
/// Every method other than [`CoordinationClient::session_id`] is a network
/// round trip and may fail with [`ServiceError::ConnectionLoss`], in which
/// case the outcome of a write is unknown.
#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    fn session_id(&self) -> SessionId;

    /// Creates a node and returns its actual path, which for sequential modes
    /// carries the service-assigned zero-padded counter.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> ServiceResult<String>;

    /// Reads a node. The watch is armed only if the node exists.
    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> ServiceResult<Vec<u8>>;

    async fn set_data(&self, path: &str, data: &[u8]) -> ServiceResult<NodeStat>;

    /// Checks for a node. The watch is armed whether or not the node exists,
    /// so a later creation is reported.
    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> ServiceResult<Option<NodeStat>>;

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> ServiceResult<Vec<String>>;

    async fn delete(&self, path: &str) -> ServiceResult<()>;

    /// Ends the session. Ephemeral nodes owned by it are removed.
    async fn close(&self) -> ServiceResult<()>;
}
