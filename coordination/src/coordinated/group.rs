use super::{
    paths::{composite_id, decode_composite_id, ensure_path, sequence_of, validate_id, ElectionPaths},
    publisher::publish_leader,
    retry::Attempts,
};
use crate::{
    config::ElectionConfig,
    group::{ElectionGroup, Listener, ListenerSet},
    service::{CoordinationClient, CreateMode, ServiceError, WatchedEvent, Watcher},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An election group whose participants are ephemeral sequential nodes in a
/// coordination service.
///
/// The leader is whatever is published at the group's leader path; the group
/// keeps a cached copy that a watch keeps up to date. All watch events are
/// consumed by one background task, and every leader transition (watch- or
/// call-driven) happens under the same async lock, one at a time.
#[derive(Debug)]
pub struct CoordinatedElectionGroup {
    id: String,
    paths: ElectionPaths,
    client: Arc<dyn CoordinationClient>,
    config: ElectionConfig,
    leader: RwLock<Option<String>>,
    transitions: Mutex<()>,
    listeners: ListenerSet,
    watcher: Watcher,
    shutdown: CancellationToken,
}

impl CoordinatedElectionGroup {
    /// Makes sure the participants container exists, fetches the current
    /// leader and starts watching for changes.
    pub async fn connect(
        id: &str,
        client: Arc<dyn CoordinationClient>,
        config: ElectionConfig,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        validate_id(id)?;
        config.validate()?;
        let paths = ElectionPaths::new(&config.root, id);
        ensure_path(client.as_ref(), &paths.participants, id, &config, &shutdown).await?;

        let (watcher, events) = mpsc::unbounded_channel();
        let group = Arc::new(Self {
            id: id.to_string(),
            paths,
            client,
            config,
            leader: RwLock::new(None),
            transitions: Mutex::new(()),
            listeners: ListenerSet::new(),
            watcher,
            shutdown,
        });

        group.bootstrap_leader().await?;
        if group.config.publish_leader {
            group.publish().await?;
            group.refresh_leader().await?;
        }
        tokio::spawn(watch_events(
            Arc::downgrade(&group),
            events,
            group.shutdown.clone(),
        ));

        info!(
            "Election group {} ready under {} (leader {:?})",
            group.id,
            group.paths.participants,
            group.leader()
        );
        Ok(group)
    }

    pub fn paths(&self) -> &ElectionPaths {
        &self.paths
    }

    pub(crate) fn shut_down(&self) {
        self.listeners.clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn attempts(&self, operation: &'static str) -> Attempts<'_> {
        Attempts::new(&self.id, operation, &self.config, &self.shutdown)
    }

    /// Reads the leader path and re-arms the watch. A missing leader arms an
    /// existence watch instead so that a later creation is still reported.
    async fn read_leader(&self) -> Result<Option<String>> {
        match self.client.get_data(&self.paths.leader, Some(&self.watcher)).await {
            Ok(data) => Ok(Some(match String::from_utf8(data) {
                Ok(leader) => leader,
                Err(err) => {
                    warn!(
                        "Leader value at {} is not valid UTF-8, caching a lossy copy",
                        self.paths.leader
                    );
                    String::from_utf8_lossy(err.as_bytes()).into_owned()
                }
            })),
            Err(ServiceError::NoNode(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn bootstrap_leader(&self) -> Result<()> {
        let _transition = self.transitions.lock().await;
        let leader = match self.read_leader().await? {
            Some(leader) => Some(leader),
            None => match self.client.exists(&self.paths.leader, Some(&self.watcher)).await? {
                None => None,
                // Created between the read and the existence check: one more read.
                Some(_) => self.read_leader().await?,
            },
        };
        debug!("Election group {} starts with leader {:?}", self.id, leader);
        *self.leader.write() = leader;
        Ok(())
    }

    async fn refresh_leader(&self) -> Result<()> {
        let _transition = self.transitions.lock().await;
        let next = match self.read_leader().await? {
            Some(leader) => Some(leader),
            None => {
                self.client
                    .exists(&self.paths.leader, Some(&self.watcher))
                    .await?;
                None
            }
        };

        let changed = {
            let mut leader = self.leader.write();
            if *leader == next {
                false
            } else {
                debug!(
                    "Election group {} leader changed {:?} -> {:?}",
                    self.id, *leader, next
                );
                *leader = next;
                true
            }
        };
        if changed {
            self.listeners.notify();
        }
        Ok(())
    }

    async fn publish(&self) -> Result<()> {
        publish_leader(self.client.as_ref(), &self.paths, Some(&self.watcher)).await
    }

    /// Publication after a membership change is best effort: the change itself
    /// already happened, and the child watch retries publication later.
    async fn republish(&self) {
        if !self.config.publish_leader {
            return;
        }
        let result = match self.publish().await {
            Ok(()) => self.refresh_leader().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("Could not publish leader for election group {}: {}", self.id, err);
        }
    }

    async fn handle_event(&self, event: &WatchedEvent) -> Result<()> {
        debug!("Election group {} got watch event {:?}", self.id, event);
        match event.path.as_deref() {
            Some(path) if path == self.paths.participants => {
                if self.config.publish_leader {
                    self.publish().await?;
                }
                self.refresh_leader().await
            }
            _ => self.refresh_leader().await,
        }
    }

    /// Looks for a node created for `composite`, lowest sequence first.
    /// Undecodable names fail the scan unless `skip_malformed` is set.
    fn find_registration(
        &self,
        children: &[String],
        composite: &str,
        skip_malformed: bool,
    ) -> Result<Option<String>> {
        let mut found = None;
        for child in children {
            let decoded = match decode_composite_id(child) {
                Ok(decoded) => decoded,
                Err(_) if skip_malformed => {
                    debug!("Election group {} skipping unrecognised node {}", self.id, child);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if decoded == composite {
                let seq = sequence_of(child);
                if found.as_ref().map_or(true, |(best, _)| seq < *best) {
                    found = Some((seq, child.clone()));
                }
            }
        }
        Ok(found.map(|(_, child)| child))
    }

    async fn join_once(&self, composite: &str, participant: &str) -> Result<()> {
        let prefix = self.paths.participant_prefix(composite);
        match self
            .client
            .create(&prefix, participant.as_bytes(), CreateMode::EphemeralSequential)
            .await
        {
            Ok(path) => {
                debug!("Joined election group {} with {}", self.id, path);
                Ok(())
            }
            Err(ServiceError::ConnectionLoss) => {
                // The node may or may not have been created.
                let children = self.client.get_children(&self.paths.participants, None).await?;
                match self.find_registration(&children, composite, false)? {
                    Some(child) => {
                        debug!(
                            "Election group {} already has {} after connection loss",
                            self.id, child
                        );
                        Ok(())
                    }
                    None => Err(ServiceError::ConnectionLoss.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn leave_once(&self, composite: &str) -> Result<()> {
        let children = match self.client.get_children(&self.paths.participants, None).await {
            Ok(children) => children,
            Err(ServiceError::NoNode(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        // Nodes written by someone else must not block our own leave.
        let Some(child) = self.find_registration(&children, composite, true)? else {
            return Ok(());
        };
        match self.client.delete(&self.paths.participant(&child)).await {
            Ok(()) => {
                debug!("Left election group {} by deleting {}", self.id, child);
                Ok(())
            }
            Err(ServiceError::NoNode(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ElectionGroup for CoordinatedElectionGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    async fn add_participant(&self, participant: &str) -> Result<()> {
        self.ensure_open()?;
        validate_id(participant)?;
        let composite = composite_id(self.client.session_id(), participant);
        let mut attempts = self.attempts("join");
        loop {
            match self.join_once(&composite, participant).await {
                Ok(()) => break,
                Err(Error::Service(err @ (ServiceError::ConnectionLoss | ServiceError::NoNode(_)))) => {
                    attempts.failed(err).await?;
                }
                Err(err) => return Err(err),
            }
        }
        self.republish().await;
        Ok(())
    }

    async fn remove_participant(&self, participant: &str) -> Result<()> {
        self.ensure_open()?;
        validate_id(participant)?;
        let composite = composite_id(self.client.session_id(), participant);
        let mut attempts = self.attempts("leave");
        loop {
            match self.leave_once(&composite).await {
                Ok(()) => break,
                Err(Error::Service(ServiceError::ConnectionLoss)) => {
                    attempts.failed(ServiceError::ConnectionLoss).await?;
                }
                Err(err) => return Err(err),
            }
        }
        self.republish().await;
        Ok(())
    }

    fn register_listener(&self, listener: Listener) {
        self.listeners.register(listener);
    }

    fn unregister_listener(&self, listener: &Listener) {
        self.listeners.unregister(listener);
    }
}

impl PartialEq for CoordinatedElectionGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CoordinatedElectionGroup {}

impl std::hash::Hash for CoordinatedElectionGroup {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

async fn watch_events(
    group: Weak<CoordinatedElectionGroup>,
    mut events: mpsc::UnboundedReceiver<WatchedEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        // Session state changes are not data changes.
        if event.is_session_event() {
            debug!("Ignoring session event {:?}", event.state);
            continue;
        }
        let Some(group) = group.upgrade() else {
            break;
        };

        // The event used up the watch that delivered it, so the refresh is
        // retried until it succeeds or the group shuts down.
        let mut attempts = group.attempts("watch refresh");
        loop {
            match group.handle_event(&event).await {
                Ok(()) => break,
                Err(Error::Service(ServiceError::ConnectionLoss)) => {
                    match attempts.failed(ServiceError::ConnectionLoss).await {
                        Ok(()) => {}
                        Err(Error::RetriesExhausted { attempts: made, .. }) => {
                            warn!(
                                "Watch refresh for election group {} still failing after {} attempts, continuing",
                                group.id, made
                            );
                            tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(group.config.retry_delay()) => {}
                            }
                            attempts = group.attempts("watch refresh");
                        }
                        Err(_) => break,
                    }
                }
                Err(err) => {
                    warn!("Watch refresh for election group {} failed: {}", group.id, err);
                    break;
                }
            }
        }
    }
    debug!("Watch task stopped");
}
