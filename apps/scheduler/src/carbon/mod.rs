pub mod cache;
pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One observation of grid carbon intensity for a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarbonRecord {
    pub region: String,
    /// gCO2 equivalent per kWh delivered; never negative.
    pub intensity: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CarbonError {
    #[error("carbon api rejected credentials")]
    InvalidCredentials,
    #[error("unknown region {0:?}")]
    UnknownRegion(String),
    #[error("carbon api rate limited")]
    RateLimited,
    #[error("invalid carbon payload: {0}")]
    InvalidPayload(String),
    #[error("carbon api request failed: {0}")]
    Transient(String),
}

impl CarbonError {
    pub fn retryable(&self) -> bool {
        matches!(self, CarbonError::RateLimited | CarbonError::Transient(_))
    }
}

/// Source of real-time carbon intensity. Implementations are expected to be
/// cache-backed; callers on the admission path treat a returned record as
/// current enough to gate scheduling on.
#[async_trait]
pub trait CarbonDataSource: Send + Sync {
    async fn get_intensity(&self, region: &str) -> Result<CarbonRecord, CarbonError>;
}
