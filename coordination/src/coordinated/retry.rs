use crate::{config::ElectionConfig, service::ServiceError, Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded, fixed-delay retry budget for one protocol step.
pub(crate) struct Attempts<'a> {
    group: &'a str,
    operation: &'static str,
    config: &'a ElectionConfig,
    shutdown: &'a CancellationToken,
    made: u32,
}

impl<'a> Attempts<'a> {
    pub(crate) fn new(
        group: &'a str,
        operation: &'static str,
        config: &'a ElectionConfig,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            group,
            operation,
            config,
            shutdown,
            made: 0,
        }
    }

    /// Records a failed attempt and waits out the retry delay.
    ///
    /// Fails with [`Error::RetriesExhausted`] once the budget is spent and with
    /// [`Error::Interrupted`] as soon as shutdown is requested.
    pub(crate) async fn failed(&mut self, err: ServiceError) -> Result<()> {
        self.made += 1;
        if self.made >= self.config.max_attempts {
            return Err(Error::RetriesExhausted {
                group: self.group.to_string(),
                operation: self.operation,
                attempts: self.made,
                last: err,
            });
        }
        warn!(
            "{} for election group {} failed ({}), attempt {}/{}",
            self.operation, self.group, err, self.made, self.config.max_attempts
        );
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(self.config.retry_delay()) => Ok(()),
        }
    }
}
