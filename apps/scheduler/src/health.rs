use crate::carbon::CarbonDataSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shared health of the external carbon signal. The admission path fails
/// open on outages, but /healthz keeps reporting the failure until the
/// source answers again.
pub struct HealthState {
    carbon_ok: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            carbon_ok: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.carbon_ok.store(true, Ordering::Relaxed);
        *self.last_error.lock().expect("health state poisoned") = None;
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        self.carbon_ok.store(false, Ordering::Relaxed);
        *self.last_error.lock().expect("health state poisoned") = Some(error.into());
    }

    pub fn healthy(&self) -> bool {
        self.carbon_ok.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("health state poisoned").clone()
    }
}

/// Probes the carbon source on a timer and keeps `HealthState` current.
pub struct HealthCheckService {
    source: Arc<dyn CarbonDataSource>,
    region: String,
    state: Arc<HealthState>,
    interval: Duration,
}

impl HealthCheckService {
    pub fn new(
        source: Arc<dyn CarbonDataSource>,
        region: String,
        state: Arc<HealthState>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            region,
            state,
            interval,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.source.get_intensity(&self.region).await {
                            Ok(_) => self.state.record_success(),
                            Err(err) => {
                                warn!(region = %self.region, "carbon health probe failed: {err}");
                                self.state.record_failure(err.to_string());
                            }
                        }
                    }
                }
            }
        });
    }
}
