use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Callback fired when a group's leader changes.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// One named election: a dynamic set of participants with at most one leader.
///
/// Groups compare equal and hash identically iff their ids are equal, so a
/// handle obtained from two lookups of the same id can be used as the same
/// map key.
#[async_trait]
pub trait ElectionGroup: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Last known leader. Never performs I/O and never fails.
    fn leader(&self) -> Option<String>;

    /// Joins the election. Every call adds a registration; listeners fire once
    /// if the net leader changed.
    async fn add_participant(&self, participant: &str) -> Result<()>;

    /// Drops one earlier registration of `participant`; a participant that
    /// already left is a no-op. The next participant is promoted if the
    /// leader left.
    async fn remove_participant(&self, participant: &str) -> Result<()>;

    fn register_listener(&self, listener: Listener);

    /// Removes one registration of `listener`, matched by pointer identity.
    fn unregister_listener(&self, listener: &Listener);
}

impl PartialEq for dyn ElectionGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for dyn ElectionGroup {}

impl Hash for dyn ElectionGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    // Data pointers only; the same Arc may carry different vtable pointers.
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Listener collection shared by both group flavours.
///
/// Dispatch iterates a snapshot, so listeners may register or unregister
/// (themselves included) while being notified.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Listener>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn unregister(&self, listener: &Listener) {
        let mut listeners = self.listeners.write();
        if let Some(idx) = listeners.iter().position(|l| same_listener(l, listener)) {
            listeners.remove(idx);
        }
    }

    pub(crate) fn clear(&self) {
        self.listeners.write().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invokes every listener in registration order.
    pub(crate) fn notify(&self) {
        let snapshot: Vec<Listener> = self.listeners.read().clone();
        for listener in snapshot {
            listener();
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}
