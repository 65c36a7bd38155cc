#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Leader election over named groups.
//!
//! A [`CoordinationManager`] maps group ids to [`ElectionGroup`]s. The
//! in-memory flavour elects the first participant to join within one process;
//! the coordinated flavour registers participants as ephemeral sequential
//! nodes in a coordination service and follows the published leader through
//! watches.

pub mod config;
pub mod coordinated;
pub mod error;
pub mod group;
pub mod manager;
pub mod memory;
pub mod service;

pub mod test_utils;

pub use config::{DeploymentMode, ElectionConfig};
pub use coordinated::{CoordinatedCoordinationManager, CoordinatedElectionGroup};
pub use error::{Error, Result};
pub use group::{ElectionGroup, Listener};
pub use manager::{manager_for, CoordinationManager};
pub use memory::{InMemoryCoordinationManager, InMemoryElectionGroup};
