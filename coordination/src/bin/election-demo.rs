use coordination::{
    manager_for,
    service::{CoordinationClient, InMemoryCoordinationService},
    test_utils::wait_for_leader,
    CoordinationManager, DeploymentMode, ElectionConfig, ElectionGroup, Result,
};
use anyhow::Context;
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

struct Node {
    name: String,
    client: Option<Arc<dyn CoordinationClient>>,
    manager: Arc<dyn CoordinationManager>,
    group: Arc<dyn ElectionGroup>,
}

async fn start_node(
    mode: DeploymentMode,
    service: &InMemoryCoordinationService,
    config: &ElectionConfig,
    group_id: &str,
) -> Result<Node> {
    let name = Uuid::new_v4().to_string();
    let client: Option<Arc<dyn CoordinationClient>> = match mode {
        DeploymentMode::Coordinated => Some(Arc::new(service.connect())),
        DeploymentMode::InMemory => None,
    };
    let manager = manager_for(mode, client.clone(), config.clone())?;
    let group = manager.election_group(group_id).await?;

    let watcher = name.clone();
    let observed = group.clone();
    group.register_listener(Arc::new(move || {
        info!("[{}] leader is now {:?}", watcher, observed.leader());
    }));
    group.add_participant(&name).await?;
    info!("Node {} joined election group {}", name, group_id);

    Ok(Node {
        name,
        client,
        manager,
        group,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = DeploymentMode::from_env().context("reading COORD_MODE")?;
    let config = ElectionConfig::from_env().context("loading election config")?;
    let group_id = env::var("COORD_GROUP").unwrap_or_else(|_| "demo".to_string());

    info!("Election demo starting...");
    info!("Mode: {:?}", mode);
    info!("Election root: {}", config.root);

    let service = InMemoryCoordinationService::new();
    let first = start_node(mode, &service, &config, &group_id).await?;

    // In-memory managers do not share state, so both nodes live in one.
    let second = match mode {
        DeploymentMode::Coordinated => start_node(mode, &service, &config, &group_id).await?,
        DeploymentMode::InMemory => {
            let name = Uuid::new_v4().to_string();
            first.group.add_participant(&name).await?;
            Node {
                name,
                client: None,
                manager: first.manager.clone(),
                group: first.group.clone(),
            }
        }
    };

    info!("Leader: {:?} (first node {})", second.group.leader(), first.name);

    match &first.client {
        Some(client) => {
            info!("Expiring session of {}", first.name);
            service.expire_session(client.session_id());
        }
        None => {
            info!("Removing {}", first.name);
            first.group.remove_participant(&first.name).await?;
        }
    }

    if wait_for_leader(second.group.as_ref(), Some(&second.name)).await {
        info!("Failover complete, leader is {}", second.name);
    } else {
        warn!(
            "Leader did not move to {}, still {:?}",
            second.name,
            second.group.leader()
        );
    }

    second.manager.close().await?;
    first.manager.close().await?;
    info!("Election demo finished");
    Ok(())
}
