//! Publishes the lowest-sequence live participant to the leader path.
//!
//! Every group that has publishing enabled runs this after it joins or leaves
//! and whenever its child watch on the participants container fires. Writers
//! may race, but each of them re-publishes on the next membership change, so
//! the leader path converges on the lowest live node.

use super::paths::{sequence_of, ElectionPaths};
use crate::{
    service::{CoordinationClient, CreateMode, ServiceError, Watcher},
    Result,
};
use tracing::debug;

pub(crate) async fn publish_leader(
    client: &dyn CoordinationClient,
    paths: &ElectionPaths,
    watch: Option<&Watcher>,
) -> Result<()> {
    let children = match client.get_children(&paths.participants, watch).await {
        Ok(children) => children,
        Err(ServiceError::NoNode(_)) => Vec::new(),
        Err(err) => return Err(err.into()),
    };

    let lowest = children
        .iter()
        .filter_map(|name| sequence_of(name).map(|seq| (seq, name)))
        .min_by_key(|(seq, _)| *seq);

    let Some((_, name)) = lowest else {
        return match client.delete(&paths.leader).await {
            Ok(()) => {
                debug!("Cleared leader at {}", paths.leader);
                Ok(())
            }
            Err(ServiceError::NoNode(_)) => Ok(()),
            Err(err) => Err(err.into()),
        };
    };

    let leader = match client.get_data(&paths.participant(name), None).await {
        Ok(data) => data,
        // Gone since the listing; the child watch reports the removal.
        Err(ServiceError::NoNode(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let current = match client.get_data(&paths.leader, None).await {
        Ok(data) => Some(data),
        Err(ServiceError::NoNode(_)) => None,
        Err(err) => return Err(err.into()),
    };
    if current.as_deref() == Some(leader.as_slice()) {
        return Ok(());
    }

    write_leader(client, &paths.leader, &leader, current.is_some()).await?;
    debug!(
        "Published leader {} from {}",
        String::from_utf8_lossy(&leader),
        name
    );
    Ok(())
}

async fn write_leader(
    client: &dyn CoordinationClient,
    path: &str,
    leader: &[u8],
    exists: bool,
) -> Result<()> {
    let first = if exists {
        client.set_data(path, leader).await.map(|_| ())
    } else {
        client.create(path, leader, CreateMode::Persistent).await.map(|_| ())
    };
    // Another publisher created or removed the node in between; flip once.
    let second = match first {
        Ok(()) => return Ok(()),
        Err(ServiceError::NoNode(_)) => {
            client.create(path, leader, CreateMode::Persistent).await.map(|_| ())
        }
        Err(ServiceError::NodeExists(_)) => client.set_data(path, leader).await.map(|_| ()),
        Err(err) => return Err(err.into()),
    };
    second.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryCoordinationService;

    async fn setup() -> (InMemoryCoordinationService, ElectionPaths) {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        for path in ["/elections", "/elections/g", "/elections/g/participants"] {
            client.create(path, b"", CreateMode::Persistent).await.unwrap();
        }
        (service, ElectionPaths::new("/elections", "g"))
    }

    #[tokio::test]
    async fn lowest_sequence_wins() {
        let (service, paths) = setup().await;
        let client = service.connect();
        for participant in ["b", "a"] {
            client
                .create(
                    &paths.participant_prefix(&format!("1-{participant}")),
                    participant.as_bytes(),
                    CreateMode::EphemeralSequential,
                )
                .await
                .unwrap();
        }

        publish_leader(&client, &paths, None).await.unwrap();
        assert_eq!(service.data(&paths.leader).as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn empty_group_clears_leader() {
        let (service, paths) = setup().await;
        let client = service.connect();
        client
            .create(&paths.leader, b"stale", CreateMode::Persistent)
            .await
            .unwrap();

        publish_leader(&client, &paths, None).await.unwrap();
        assert!(service.data(&paths.leader).is_none());
    }

    #[tokio::test]
    async fn replaces_stale_leader() {
        let (service, paths) = setup().await;
        let client = service.connect();
        client
            .create(&paths.leader, b"stale", CreateMode::Persistent)
            .await
            .unwrap();
        client
            .create(&paths.participant_prefix("1-x"), b"x", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        publish_leader(&client, &paths, None).await.unwrap();
        assert_eq!(service.data(&paths.leader).as_deref(), Some(&b"x"[..]));
    }
}
