use crate::annotations;
use crate::config::{self, ConfigError, PricingConfig};
use chrono::{DateTime, Datelike, Timelike, Utc};
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price oracle misconfigured: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Annotation(#[from] annotations::AnnotationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Peak,
    OffPeak,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Peak => "peak",
            Period::OffPeak => "off-peak",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PriceCheck {
    pub rate: f64,
    pub threshold: f64,
    pub period: Period,
    /// Strict greater-than: a rate equal to the threshold passes.
    pub exceeds: bool,
}

pub trait PriceOracle: Send + Sync {
    fn current_rate(&self, now: DateTime<Utc>) -> f64;
    fn is_peak(&self, now: DateTime<Utc>) -> bool;
    fn check_constraints(&self, pod: &Pod, now: DateTime<Utc>) -> Result<PriceCheck, PriceError>;
}

#[derive(Debug, Clone)]
struct TouWindow {
    days: Vec<u8>,
    start_minute: u32,
    /// Exclusive.
    end_minute: u32,
    peak_rate: f64,
    off_peak_rate: f64,
}

impl TouWindow {
    fn matches(&self, now: DateTime<Utc>) -> bool {
        let day = now.weekday().num_days_from_sunday() as u8;
        if !self.days.contains(&day) {
            return false;
        }
        let minute = now.hour() * 60 + now.minute();
        minute >= self.start_minute && minute < self.end_minute
    }
}

/// Time-of-use schedule oracle. Windows are evaluated in configuration
/// order; outside every window the first window's off-peak rate applies.
pub struct TouPriceOracle {
    windows: Vec<TouWindow>,
}

impl TouPriceOracle {
    pub fn from_config(config: &PricingConfig) -> Result<Self, ConfigError> {
        if config.schedules.is_empty() {
            return Err(ConfigError::Invalid(
                "pricing.schedules must not be empty".to_string(),
            ));
        }
        let mut windows = Vec::with_capacity(config.schedules.len());
        for (index, window) in config.schedules.iter().enumerate() {
            let days = config::parse_days(&window.day_of_week)
                .map_err(|reason| ConfigError::InvalidWindow { index, reason })?;
            let start_minute = config::parse_minute_of_day(&window.start_time)
                .map_err(|reason| ConfigError::InvalidWindow { index, reason })?;
            let end_minute = config::parse_minute_of_day(&window.end_time)
                .map_err(|reason| ConfigError::InvalidWindow { index, reason })?;
            windows.push(TouWindow {
                days,
                start_minute,
                end_minute,
                peak_rate: window.peak_rate,
                off_peak_rate: window.off_peak_rate,
            });
        }
        Ok(Self { windows })
    }

    fn active_window(&self, now: DateTime<Utc>) -> Option<&TouWindow> {
        self.windows.iter().find(|window| window.matches(now))
    }

    fn off_peak_rate(&self) -> f64 {
        self.windows[0].off_peak_rate
    }

    fn resolve_threshold(&self, pod: &Pod) -> Result<f64, PriceError> {
        if let Some(threshold) = annotations::parse_f64(pod, annotations::PRICE_THRESHOLD)? {
            return Ok(threshold);
        }
        Ok(self.off_peak_rate())
    }
}

impl PriceOracle for TouPriceOracle {
    fn current_rate(&self, now: DateTime<Utc>) -> f64 {
        match self.active_window(now) {
            Some(window) => window.peak_rate,
            None => self.off_peak_rate(),
        }
    }

    fn is_peak(&self, now: DateTime<Utc>) -> bool {
        self.active_window(now).is_some()
    }

    fn check_constraints(&self, pod: &Pod, now: DateTime<Utc>) -> Result<PriceCheck, PriceError> {
        let rate = self.current_rate(now);
        let threshold = self.resolve_threshold(pod)?;
        let period = if self.is_peak(now) {
            Period::Peak
        } else {
            Period::OffPeak
        };
        Ok(PriceCheck {
            rate,
            threshold,
            period,
            exceeds: rate > threshold,
        })
    }
}
