use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/elections";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 50;

/// Tuning for coordinated election groups.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Namespace under which every group keeps its participants and leader.
    pub root: String,
    /// Upper bound on create/delete attempts when the service is flaky.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub retry_delay_ms: u64,
    /// Whether groups publish the lowest-sequence participant to the leader
    /// path themselves, or only observe a value published by someone else.
    pub publish_leader: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            publish_leader: true,
        }
    }
}

impl ElectionConfig {
    /// Defaults overlaid with `COORD_ELECTION_ROOT`, `COORD_MAX_ATTEMPTS`,
    /// `COORD_RETRY_DELAY_MS` and `COORD_PUBLISH_LEADER`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(root) = env::var("COORD_ELECTION_ROOT") {
            config.root = root;
        }
        if let Some(attempts) = parse_var("COORD_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(delay) = parse_var("COORD_RETRY_DELAY_MS")? {
            config.retry_delay_ms = delay;
        }
        if let Some(publish) = parse_var("COORD_PUBLISH_LEADER")? {
            config.publish_leader = publish;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.starts_with('/') || self.root.len() < 2 || self.root.ends_with('/') {
            return Err(Error::Config(format!(
                "election root must be an absolute path without a trailing slash, got {:?}",
                self.root
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Which [`CoordinationManager`](crate::CoordinationManager) a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// Single process; groups live on the heap.
    InMemory,
    /// Groups backed by an external coordination service.
    Coordinated,
}

impl DeploymentMode {
    /// Reads `COORD_MODE`, defaulting to in-memory.
    pub fn from_env() -> Result<Self> {
        Ok(parse_var("COORD_MODE")?.unwrap_or(DeploymentMode::InMemory))
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-memory" | "inmemory" | "heap" => Ok(DeploymentMode::InMemory),
            "coordinated" | "zk" => Ok(DeploymentMode::Coordinated),
            other => Err(Error::Config(format!("unknown deployment mode {other:?}"))),
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
