use crate::{
    config::{DeploymentMode, ElectionConfig},
    coordinated::CoordinatedCoordinationManager,
    group::ElectionGroup,
    memory::InMemoryCoordinationManager,
    service::CoordinationClient,
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Registry of election groups that owns the underlying connection.
#[async_trait]
pub trait CoordinationManager: Send + Sync + std::fmt::Debug {
    /// Returns the group for `id`, creating it on first use. Concurrent first
    /// lookups of the same id build exactly one group.
    async fn election_group(&self, id: &str) -> Result<Arc<dyn ElectionGroup>>;

    /// Releases the connection and tears down every group. Idempotent; later
    /// lookups and membership changes fail with [`Error::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Builds the manager for a deployment mode. The coordinated mode needs a
/// connected client.
pub fn manager_for(
    mode: DeploymentMode,
    client: Option<Arc<dyn CoordinationClient>>,
    config: ElectionConfig,
) -> Result<Arc<dyn CoordinationManager>> {
    match (mode, client) {
        (DeploymentMode::InMemory, _) => Ok(Arc::new(InMemoryCoordinationManager::new())),
        (DeploymentMode::Coordinated, Some(client)) => {
            Ok(Arc::new(CoordinatedCoordinationManager::new(client, config)?))
        }
        (DeploymentMode::Coordinated, None) => Err(Error::Config(
            "coordinated mode requires a coordination service client".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryCoordinationService;

    #[tokio::test]
    async fn coordinated_mode_without_client_is_config_error() {
        let err = manager_for(DeploymentMode::Coordinated, None, ElectionConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn builds_both_flavours() {
        let in_memory =
            manager_for(DeploymentMode::InMemory, None, ElectionConfig::default()).unwrap();
        let group = in_memory.election_group("1").await.unwrap();
        assert_eq!(group.id(), "1");

        let service = InMemoryCoordinationService::new();
        let client: Arc<dyn CoordinationClient> = Arc::new(service.connect());
        let coordinated =
            manager_for(DeploymentMode::Coordinated, Some(client), ElectionConfig::default())
                .unwrap();
        let group = coordinated.election_group("1").await.unwrap();
        assert_eq!(group.id(), "1");
        assert!(service.data("/elections/1/participants").is_some());

        in_memory.close().await.unwrap();
        coordinated.close().await.unwrap();
    }
}
