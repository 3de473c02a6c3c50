use crate::carbon::cache::{CarbonCache, Freshness};
use crate::carbon::{CarbonDataSource, CarbonError, CarbonRecord};
use crate::clock::Clock;
use crate::config::CarbonConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use std::cmp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Spaces outbound requests at least `1s / rate` apart, process-wide.
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(per_second: f64) -> Self {
        let min_interval = Duration::from_secs_f64(1.0 / per_second.max(0.001));
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = cmp::max(now, *next) + self.min_interval;
    }
}

#[derive(Debug, Deserialize)]
struct IntensityEnvelope {
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Electricity Maps style client: cache-first, then HTTP with jittered
/// exponential backoff under a global rate limit.
pub struct ElectricityMapsClient {
    http: reqwest::Client,
    config: CarbonConfig,
    cache: Arc<CarbonCache>,
    limiter: RateLimiter,
    /// Collapses concurrent misses into one upstream fetch.
    flight: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl ElectricityMapsClient {
    pub fn new(
        config: CarbonConfig,
        cache: Arc<CarbonCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_seconds))
            .build()
            .context("failed to build carbon api client")?;
        let limiter = RateLimiter::new(config.rate_limit_per_second);
        Ok(Self {
            http,
            config,
            cache,
            limiter,
            flight: Mutex::new(()),
            clock,
        })
    }

    async fn fetch_once(&self, region: &str) -> Result<CarbonRecord, CarbonError> {
        let url = format!("{}{}", self.config.base_url, region);
        let response = self
            .http
            .get(&url)
            .header("auth-token", &self.config.api_key)
            .send()
            .await
            .map_err(|err| CarbonError::Transient(err.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CarbonError::InvalidCredentials)
            }
            StatusCode::NOT_FOUND => return Err(CarbonError::UnknownRegion(region.to_string())),
            StatusCode::TOO_MANY_REQUESTS => return Err(CarbonError::RateLimited),
            status => {
                return Err(CarbonError::Transient(format!(
                    "unexpected status {status} from {url}"
                )))
            }
        }

        let envelope: IntensityEnvelope = response
            .json()
            .await
            .map_err(|err| CarbonError::InvalidPayload(err.to_string()))?;
        if !envelope.carbon_intensity.is_finite() || envelope.carbon_intensity < 0.0 {
            return Err(CarbonError::InvalidPayload(format!(
                "carbon intensity {} out of range",
                envelope.carbon_intensity
            )));
        }

        Ok(CarbonRecord {
            region: region.to_string(),
            intensity: envelope.carbon_intensity,
            observed_at: envelope.timestamp.unwrap_or_else(|| self.clock.now()),
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.retry_delay_ms)
            .saturating_mul(1u32 << attempt.min(16));
        let capped = cmp::min(base, MAX_BACKOFF);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        capped.mul_f64(jitter)
    }

    async fn fetch_with_retry(&self, region: &str) -> Result<CarbonRecord, CarbonError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match self.fetch_once(region).await {
                Ok(record) => {
                    self.cache.set(record.clone());
                    return Ok(record);
                }
                Err(err) if err.retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        region,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "carbon fetch failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl CarbonDataSource for ElectricityMapsClient {
    async fn get_intensity(&self, region: &str) -> Result<CarbonRecord, CarbonError> {
        if let (Some(record), Freshness::Fresh) = self.cache.get(region) {
            debug!(region, intensity = record.intensity, "carbon cache hit");
            return Ok(record);
        }
        let _flight = self.flight.lock().await;
        // Another caller may have refreshed while we waited on the flight.
        if let (Some(record), Freshness::Fresh) = self.cache.get(region) {
            return Ok(record);
        }
        self.fetch_with_retry(region).await
    }
}
