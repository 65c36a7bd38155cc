use crate::service::ServiceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination service error: {0}")]
    Service(ServiceError),

    #[error("Gave up on {operation} for election group {group:?} after {attempts} attempts")]
    RetriesExhausted {
        group: String,
        operation: &'static str,
        attempts: u32,
        #[source]
        last: ServiceError,
    },

    #[error("Interrupted while waiting to retry")]
    Interrupted,

    #[error("Could not decode participant node name {0:?}")]
    MalformedNodeName(String),

    #[error("Invalid id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("Coordination manager is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        match err {
            // A closed client means the owning manager went away underneath us.
            ServiceError::Closed => Error::Closed,
            other => Error::Service(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn closed_client_maps_to_closed() {
        assert!(matches!(Error::from(ServiceError::Closed), Error::Closed));
        assert!(matches!(
            Error::from(ServiceError::ConnectionLoss),
            Error::Service(ServiceError::ConnectionLoss)
        ));
    }

    #[test]
    fn retries_exhausted_keeps_last_failure_as_source() {
        let err = Error::RetriesExhausted {
            group: "shard-1".to_string(),
            operation: "join",
            attempts: 20,
            last: ServiceError::ConnectionLoss,
        };
        assert!(err.to_string().contains("after 20 attempts"));
        assert!(err.source().is_some());
    }

    #[test]
    fn foreign_errors_become_other() {
        let err: Error = anyhow::anyhow!("listener panicked").into();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(err.to_string(), "Other error: listener panicked");
    }
}
