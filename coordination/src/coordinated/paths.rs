//! Namespace layout and participant node naming.
//!
//! ```text
//! <root>/<group>/participants/<session>-<participant>-n_<seq>   ephemeral, sequential
//! <root>/<group>/leader                                         published leader
//! ```

use super::retry::Attempts;
use crate::{
    config::ElectionConfig,
    service::{CoordinationClient, CreateMode, ServiceError, SessionId},
    Error, Result,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Separates the composite id from the service-assigned counter.
pub const SEQUENCE_MARKER: &str = "-n_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionPaths {
    pub participants: String,
    pub leader: String,
}

impl ElectionPaths {
    pub fn new(root: &str, group: &str) -> Self {
        Self {
            participants: format!("{root}/{group}/participants"),
            leader: format!("{root}/{group}/leader"),
        }
    }

    /// Path handed to a sequential create; the service appends the counter.
    pub fn participant_prefix(&self, composite: &str) -> String {
        format!("{}/{composite}{SEQUENCE_MARKER}", self.participants)
    }

    pub fn participant(&self, child: &str) -> String {
        format!("{}/{child}", self.participants)
    }
}

pub fn composite_id(session: SessionId, participant: &str) -> String {
    format!("{session}-{participant}")
}

/// Recovers the composite id from a participant node name (or full path).
pub fn decode_composite_id(name: &str) -> Result<&str> {
    let malformed = || Error::MalformedNodeName(name.to_string());
    let base = name.rsplit('/').next().unwrap_or(name);
    let (composite, sequence) = base.rsplit_once(SEQUENCE_MARKER).ok_or_else(malformed)?;
    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    if !composite.contains('-') {
        return Err(malformed());
    }
    Ok(composite)
}

/// The service-assigned counter of a participant node, if the name has one.
pub fn sequence_of(name: &str) -> Option<u64> {
    let (_, sequence) = name.rsplit_once(SEQUENCE_MARKER)?;
    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    sequence.parse().ok()
}

pub(crate) fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        "must not be empty"
    } else if id.contains('/') {
        "must not contain '/'"
    } else {
        return Ok(());
    };
    Err(Error::InvalidId {
        id: id.to_string(),
        reason,
    })
}

/// Creates `path` and any missing ancestors as persistent nodes.
pub(crate) async fn ensure_path(
    client: &dyn CoordinationClient,
    path: &str,
    group: &str,
    config: &ElectionConfig,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut attempts = Attempts::new(group, "ensure path", config, shutdown);
    loop {
        match make_path(client, path).await {
            Ok(()) => return Ok(()),
            Err(ServiceError::ConnectionLoss) => attempts.failed(ServiceError::ConnectionLoss).await?,
            Err(err) => return Err(err.into()),
        }
    }
}

async fn make_path(client: &dyn CoordinationClient, path: &str) -> std::result::Result<(), ServiceError> {
    if client.exists(path, None).await?.is_some() {
        return Ok(());
    }
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        match client.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) => debug!("Created {}", current),
            Err(ServiceError::NodeExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
