use super::group::CoordinatedElectionGroup;
use crate::{
    config::ElectionConfig,
    group::ElectionGroup,
    manager::CoordinationManager,
    service::CoordinationClient,
    Error, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

type GroupSlot = Arc<OnceCell<Arc<CoordinatedElectionGroup>>>;

/// Hands out [`CoordinatedElectionGroup`]s bound to one shared client.
///
/// Closing the manager cancels every in-flight retry and watch task before
/// the client is closed, so later calls fail with [`Error::Closed`] instead of
/// touching a dead session.
#[derive(Debug)]
pub struct CoordinatedCoordinationManager {
    client: Arc<dyn CoordinationClient>,
    config: ElectionConfig,
    groups: DashMap<String, GroupSlot>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl CoordinatedCoordinationManager {
    pub fn new(client: Arc<dyn CoordinationClient>, config: ElectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            groups: DashMap::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn group_count(&self) -> usize {
        self.groups.iter().filter(|slot| slot.value().initialized()).count()
    }
}

#[async_trait]
impl CoordinationManager for CoordinatedCoordinationManager {
    async fn election_group(&self, id: &str) -> Result<Arc<dyn ElectionGroup>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let slot: GroupSlot = self
            .groups
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let group = slot
            .get_or_try_init(|| {
                CoordinatedElectionGroup::connect(
                    id,
                    self.client.clone(),
                    self.config.clone(),
                    self.shutdown.child_token(),
                )
            })
            .await?
            .clone();
        Ok(group)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            "Closing coordination manager for session {} ({} groups)",
            self.client.session_id(),
            self.groups.len()
        );
        self.shutdown.cancel();
        for slot in self.groups.iter() {
            if let Some(group) = slot.value().get() {
                group.shut_down();
            }
        }
        self.groups.clear();
        self.client.close().await?;
        Ok(())
    }
}
