use crate::{
    group::{ElectionGroup, Listener},
    service::{CoordinationClient, InMemoryCoordinationService},
    ElectionConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// A listener that counts its invocations.
pub fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let listener: Listener = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (listener, calls)
}

/// Config with a tiny retry delay so failure paths run quickly.
pub fn fast_retry_config() -> ElectionConfig {
    ElectionConfig {
        retry_delay_ms: 1,
        ..ElectionConfig::default()
    }
}

/// A fresh session on `service`, typed the way managers take it.
pub fn connect(service: &InMemoryCoordinationService) -> Arc<dyn CoordinationClient> {
    Arc::new(service.connect())
}

/// Polls until `condition` holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Waits for a group's cached leader to settle on `expected`.
pub async fn wait_for_leader(group: &dyn ElectionGroup, expected: Option<&str>) -> bool {
    wait_until(DEFAULT_WAIT, || group.leader().as_deref() == expected).await
}

#[derive(Debug)]
pub struct LatencyMeasurement {
    pub operation: String,
    pub start_time: Instant,
    pub latency_us: u64,
}

impl LatencyMeasurement {
    pub fn start(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start_time: Instant::now(),
            latency_us: 0,
        }
    }

    pub fn stop(&mut self) {
        self.latency_us = u64::try_from(self.start_time.elapsed().as_micros()).unwrap_or(u64::MAX);
    }

    pub fn assert_milliseconds(&self, max_ms: u64) {
        let ms = self.latency_us / 1000;
        assert!(
            ms <= max_ms,
            "{} took {}ms, expected <= {}ms",
            self.operation,
            ms,
            max_ms
        );
    }
}
