//! An in-process coordination service.
//!
//! Behaves like a single-server hierarchical coordination service: persistent
//! and ephemeral nodes, per-parent sequence counters, one-shot data and child
//! watches, and session expiry. It can also simulate the failures the election
//! protocol has to survive: a partitioned session sees `ConnectionLoss` on
//! every call, and queued [`Fault`]s fail individual operations either before
//! or after the write has been applied.

use super::{
    CoordinationClient, CreateMode, EventType, NodeStat, ServiceError, ServiceResult, SessionId,
    SessionState, WatchedEvent, Watcher,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FIRST_SESSION_ID: SessionId = 0x0100_0000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    GetData,
    SetData,
    Exists,
    GetChildren,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The request never reaches the service.
    ConnectionLossBeforeApply,
    /// The request is applied but the reply is lost.
    ConnectionLossAfterApply,
    /// The service answers with the given error without applying anything.
    Fail(ServiceError),
}

/// A one-shot failure consumed by the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub operation: Operation,
    /// Restrict the fault to one session; `None` matches any session.
    pub session: Option<SessionId>,
    pub kind: FaultKind,
}

impl Fault {
    pub fn new(operation: Operation, kind: FaultKind) -> Self {
        Self {
            operation,
            session: None,
            kind,
        }
    }

    pub fn for_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            next_sequence: 0,
        }
    }
}

#[derive(Debug)]
struct Watch {
    session: SessionId,
    watcher: Watcher,
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<Watch>>,
    child_watches: HashMap<String, Vec<Watch>>,
    live_sessions: HashSet<SessionId>,
    partitioned: HashSet<SessionId>,
    faults: VecDeque<Fault>,
    next_session: SessionId,
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn is_valid_path(path: &str) -> bool {
    path == "/" || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"))
}

fn arm(watches: &mut HashMap<String, Vec<Watch>>, path: &str, session: SessionId, watcher: &Watcher) {
    let list = watches.entry(path.to_string()).or_default();
    if !list.iter().any(|w| w.watcher.same_channel(watcher)) {
        list.push(Watch {
            session,
            watcher: watcher.clone(),
        });
    }
}

fn fire(watches: &mut HashMap<String, Vec<Watch>>, path: &str, event_type: EventType) {
    if let Some(list) = watches.remove(path) {
        for watch in list {
            // A dropped receiver just means nobody cares anymore.
            let _ = watch.watcher.send(WatchedEvent::node(event_type, path));
        }
    }
}

impl State {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            live_sessions: HashSet::new(),
            partitioned: HashSet::new(),
            faults: VecDeque::new(),
            next_session: FIRST_SESSION_ID,
        }
    }

    fn take_fault(&mut self, operation: Operation, session: SessionId) -> Option<FaultKind> {
        let idx = self.faults.iter().position(|f| {
            f.operation == operation && f.session.map_or(true, |s| s == session)
        })?;
        self.faults.remove(idx).map(|f| f.kind)
    }

    fn stat(&self, path: &str) -> Option<NodeStat> {
        let node = self.nodes.get(path)?;
        Some(NodeStat {
            version: node.version,
            num_children: self.children(path).len(),
            ephemeral_owner: node.ephemeral_owner,
        })
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> ServiceResult<String> {
        if !is_valid_path(path) && !(mode.is_sequential() && path.ends_with('/')) {
            return Err(ServiceError::NoNode(path.to_string()));
        }
        let parent_path = parent_of(path).ok_or_else(|| ServiceError::NodeExists(path.to_string()))?;
        let parent = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| ServiceError::NoNode(parent_path.to_string()))?;
        if parent.ephemeral_owner.is_some() {
            return Err(ServiceError::NoChildrenForEphemerals(parent_path.to_string()));
        }

        let actual = if mode.is_sequential() {
            let seq = parent.next_sequence;
            parent.next_sequence += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(ServiceError::NodeExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(actual.clone(), Node::new(data.to_vec(), owner));
        fire(&mut self.data_watches, &actual, EventType::NodeCreated);
        fire(&mut self.child_watches, parent_path, EventType::NodeChildrenChanged);
        Ok(actual)
    }

    fn delete(&mut self, path: &str) -> ServiceResult<()> {
        if path == "/" || !self.nodes.contains_key(path) {
            return Err(ServiceError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(ServiceError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        fire(&mut self.data_watches, path, EventType::NodeDeleted);
        fire(&mut self.child_watches, path, EventType::NodeDeleted);
        if let Some(parent) = parent_of(path) {
            fire(&mut self.child_watches, parent, EventType::NodeChildrenChanged);
        }
        Ok(())
    }

    fn set_data(&mut self, path: &str, data: &[u8]) -> ServiceResult<NodeStat> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| ServiceError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        node.version += 1;
        fire(&mut self.data_watches, path, EventType::NodeDataChanged);
        self.stat(path).ok_or_else(|| ServiceError::NoNode(path.to_string()))
    }

    fn end_session(&mut self, session: SessionId, state: SessionState) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        self.partitioned.remove(&session);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            let _ = self.delete(&path);
        }

        let mut notified: Vec<Watcher> = Vec::new();
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for list in watches.values_mut() {
                list.retain(|w| {
                    if w.session != session {
                        return true;
                    }
                    if !notified.iter().any(|n| n.same_channel(&w.watcher)) {
                        notified.push(w.watcher.clone());
                    }
                    false
                });
            }
            watches.retain(|_, list| !list.is_empty());
        }
        for watcher in notified {
            let _ = watcher.send(WatchedEvent::session(state));
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    latency: Mutex<Duration>,
}

/// Handle to the in-process service. Cloning shares the same node tree.
#[derive(Debug, Clone)]
pub struct InMemoryCoordinationService {
    shared: Arc<Shared>,
}

impl InMemoryCoordinationService {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new()),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Opens a new session.
    pub fn connect(&self) -> InMemoryClient {
        let session = {
            let mut state = self.shared.state.lock();
            let session = state.next_session;
            state.next_session += 1;
            state.live_sessions.insert(session);
            session
        };
        debug!("Opened coordination session {}", session);
        InMemoryClient {
            shared: self.shared.clone(),
            session,
            closed: AtomicBool::new(false),
        }
    }

    /// Simulated round-trip time added to every client call.
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Expires a session as if its heartbeats had stopped.
    pub fn expire_session(&self, session: SessionId) {
        debug!("Expiring coordination session {}", session);
        self.shared
            .state
            .lock()
            .end_session(session, SessionState::Expired);
    }

    /// Cuts a session off: every call fails with `ConnectionLoss` until healed.
    pub fn partition(&self, session: SessionId) {
        self.shared.state.lock().partitioned.insert(session);
    }

    pub fn heal(&self, session: SessionId) {
        self.shared.state.lock().partitioned.remove(&session);
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.shared.state.lock().faults.push_back(fault);
    }

    pub fn pending_faults(&self) -> usize {
        self.shared.state.lock().faults.len()
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.state.lock().nodes.get(path).map(|n| n.data.clone())
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.shared.state.lock().children(path)
    }

    pub fn is_live(&self, session: SessionId) -> bool {
        self.shared.state.lock().live_sessions.contains(&session)
    }
}

impl Default for InMemoryCoordinationService {
    fn default() -> Self {
        Self::new()
    }
}

/// A session on an [`InMemoryCoordinationService`].
#[derive(Debug)]
pub struct InMemoryClient {
    shared: Arc<Shared>,
    session: SessionId,
    closed: AtomicBool,
}

impl InMemoryClient {
    async fn round_trip(&self) {
        let latency = *self.shared.latency.lock();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }

    async fn call<T>(
        &self,
        operation: Operation,
        apply: impl FnOnce(&mut State, SessionId) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::Closed);
        }
        self.round_trip().await;

        let mut state = self.shared.state.lock();
        if !state.live_sessions.contains(&self.session) {
            return Err(ServiceError::SessionExpired(self.session));
        }
        if state.partitioned.contains(&self.session) {
            return Err(ServiceError::ConnectionLoss);
        }
        match state.take_fault(operation, self.session) {
            Some(FaultKind::ConnectionLossBeforeApply) => Err(ServiceError::ConnectionLoss),
            Some(FaultKind::ConnectionLossAfterApply) => {
                let _ = apply(&mut state, self.session);
                Err(ServiceError::ConnectionLoss)
            }
            Some(FaultKind::Fail(err)) => Err(err),
            None => apply(&mut state, self.session),
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> ServiceResult<String> {
        self.call(Operation::Create, |state, session| {
            state.create(session, path, data, mode)
        })
        .await
    }

    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> ServiceResult<Vec<u8>> {
        self.call(Operation::GetData, |state, session| {
            let data = state
                .nodes
                .get(path)
                .map(|node| node.data.clone())
                .ok_or_else(|| ServiceError::NoNode(path.to_string()))?;
            if let Some(watcher) = watch {
                arm(&mut state.data_watches, path, session, watcher);
            }
            Ok(data)
        })
        .await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> ServiceResult<NodeStat> {
        self.call(Operation::SetData, |state, _| state.set_data(path, data))
            .await
    }

    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> ServiceResult<Option<NodeStat>> {
        self.call(Operation::Exists, |state, session| {
            if let Some(watcher) = watch {
                arm(&mut state.data_watches, path, session, watcher);
            }
            Ok(state.stat(path))
        })
        .await
    }

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> ServiceResult<Vec<String>> {
        self.call(Operation::GetChildren, |state, session| {
            if !state.nodes.contains_key(path) {
                return Err(ServiceError::NoNode(path.to_string()));
            }
            if let Some(watcher) = watch {
                arm(&mut state.child_watches, path, session, watcher);
            }
            Ok(state.children(path))
        })
        .await
    }

    async fn delete(&self, path: &str) -> ServiceResult<()> {
        self.call(Operation::Delete, |state, _| state.delete(path))
            .await
    }

    async fn close(&self) -> ServiceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing coordination session {}", self.session);
        self.shared
            .state
            .lock()
            .end_session(self.session, SessionState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn sequential_nodes_get_padded_counters() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        client.create("/e", b"", CreateMode::Persistent).await.unwrap();

        let first = client
            .create("/e/a-n_", b"a", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = client
            .create("/e/b-n_", b"b", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert_eq!(first, "/e/a-n_0000000000");
        assert_eq!(second, "/e/b-n_0000000001");
        let mut children = client.get_children("/e", None).await.unwrap();
        children.sort();
        assert_eq!(children, vec!["a-n_0000000000", "b-n_0000000001"]);
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let err = client
            .create("/missing/child", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::NoNode("/missing".to_string()));
    }

    #[tokio::test]
    async fn ephemeral_nodes_go_away_with_their_session() {
        let service = InMemoryCoordinationService::new();
        let owner = service.connect();
        let observer = service.connect();
        owner.create("/e", b"", CreateMode::Persistent).await.unwrap();
        owner
            .create("/e/x", b"x", CreateMode::Ephemeral)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        observer.get_children("/e", Some(&tx)).await.unwrap();

        service.expire_session(owner.session_id());

        assert!(service.children("/e").is_empty());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::NodeChildrenChanged);
        assert_eq!(event.path.as_deref(), Some("/e"));
        assert!(matches!(
            owner.get_data("/e", None).await,
            Err(ServiceError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn exists_arms_watch_on_missing_node() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(client.exists("/leader", Some(&tx)).await.unwrap().is_none());
        client
            .create("/leader", b"1", CreateMode::Persistent)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, WatchedEvent::node(EventType::NodeCreated, "/leader"));
    }

    #[tokio::test]
    async fn watches_fire_once_per_arming() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        client
            .create("/leader", b"1", CreateMode::Persistent)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Arming twice with the same channel still yields one event.
        client.get_data("/leader", Some(&tx)).await.unwrap();
        client.exists("/leader", Some(&tx)).await.unwrap();
        client.set_data("/leader", b"2").await.unwrap();
        client.set_data("/leader", b"3").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::NodeDataChanged);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fault_after_apply_reports_connection_loss() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        service.inject_fault(Fault::new(
            Operation::Create,
            FaultKind::ConnectionLossAfterApply,
        ));

        let err = client
            .create("/x", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::ConnectionLoss);
        assert!(service.data("/x").is_some());
        assert_eq!(service.pending_faults(), 0);
    }

    #[tokio::test]
    async fn partitioned_session_loses_connection_until_healed() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        service.partition(client.session_id());
        assert_eq!(
            client.exists("/", None).await.unwrap_err(),
            ServiceError::ConnectionLoss
        );
        service.heal(client.session_id());
        assert!(client.exists("/", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_session_watchers_get_session_event() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.exists("/leader", Some(&tx)).await.unwrap();

        service.expire_session(client.session_id());

        let event = rx.recv().await.unwrap();
        assert!(event.is_session_event());
        assert_eq!(event.state, SessionState::Expired);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_calls() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(
            client.exists("/", None).await.unwrap_err(),
            ServiceError::Closed
        );
        assert!(!service.is_live(client.session_id()));
    }

    #[test]
    fn parent_paths() {
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }
}
