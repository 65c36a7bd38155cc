//! Single-process election groups.
//!
//! Participants are kept in join order and the first one leads. Correct only
//! within one address space.

use crate::{
    group::{ElectionGroup, Listener, ListenerSet},
    manager::CoordinationManager,
    Error, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Membership {
    participants: Vec<String>,
    leader: Option<String>,
}

impl Membership {
    /// Recomputes the leader and reports whether it changed.
    fn elect(&mut self) -> bool {
        let next = self.participants.first().cloned();
        if next == self.leader {
            return false;
        }
        self.leader = next;
        true
    }
}

#[derive(Debug)]
pub struct InMemoryElectionGroup {
    id: String,
    membership: Mutex<Membership>,
    listeners: ListenerSet,
    closed: AtomicBool,
}

impl InMemoryElectionGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            membership: Mutex::new(Membership::default()),
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Current participants in join order.
    pub fn participants(&self) -> Vec<String> {
        self.membership.lock().participants.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Applies a membership change and notifies listeners if the leader moved.
    ///
    /// Listeners run after the lock is released so that they may call back into
    /// the group. Notifications from concurrent changes may therefore overlap
    /// or arrive out of order; a listener should read [`ElectionGroup::leader`]
    /// rather than assume which change woke it.
    fn apply(&self, change: impl FnOnce(&mut Vec<String>)) {
        let changed = {
            let mut membership = self.membership.lock();
            change(&mut membership.participants);
            let changed = membership.elect();
            if changed {
                debug!("Election group {} leader is now {:?}", self.id, membership.leader);
            }
            changed
        };
        if changed {
            self.listeners.notify();
        }
    }

    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.clear();
    }
}

#[async_trait]
impl ElectionGroup for InMemoryElectionGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn leader(&self) -> Option<String> {
        self.membership.lock().leader.clone()
    }

    async fn add_participant(&self, participant: &str) -> Result<()> {
        self.ensure_open()?;
        self.apply(|participants| participants.push(participant.to_string()));
        Ok(())
    }

    async fn remove_participant(&self, participant: &str) -> Result<()> {
        self.ensure_open()?;
        self.apply(|participants| {
            if let Some(idx) = participants.iter().position(|p| p == participant) {
                participants.remove(idx);
            }
        });
        Ok(())
    }

    fn register_listener(&self, listener: Listener) {
        self.listeners.register(listener);
    }

    fn unregister_listener(&self, listener: &Listener) {
        self.listeners.unregister(listener);
    }
}

impl PartialEq for InMemoryElectionGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InMemoryElectionGroup {}

impl std::hash::Hash for InMemoryElectionGroup {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Hands out [`InMemoryElectionGroup`]s; holds no external resources.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationManager {
    groups: DashMap<String, Arc<InMemoryElectionGroup>>,
    closed: AtomicBool,
}

impl InMemoryCoordinationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[async_trait]
impl CoordinationManager for InMemoryCoordinationManager {
    async fn election_group(&self, id: &str) -> Result<Arc<dyn ElectionGroup>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let group = self
            .groups
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Creating in-memory election group {}", id);
                Arc::new(InMemoryElectionGroup::new(id))
            })
            .clone();
        Ok(group)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing in-memory coordination manager ({} groups)", self.groups.len());
        for entry in self.groups.iter() {
            entry.value().shut_down();
        }
        self.groups.clear();
        Ok(())
    }
}
