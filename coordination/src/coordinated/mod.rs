//! Election groups backed by a [`CoordinationClient`](crate::service::CoordinationClient).
//!
//! Joining creates an ephemeral sequential node under the group's
//! participants container, so a participant disappears with its session.
//! Connection loss during the create is ambiguous and is resolved by looking
//! for the node before trying again.

mod group;
mod manager;
pub mod paths;
mod publisher;
mod retry;

pub use group::CoordinatedElectionGroup;
pub use manager::CoordinatedCoordinationManager;
pub use paths::ElectionPaths;
