pub mod admission;
pub mod annotations;
pub mod carbon;
pub mod cli;
pub mod clock;
pub mod config;
pub mod deferral;
pub mod extender;
pub mod hardware;
pub mod health;
pub mod kubeutil;
pub mod metrics;
pub mod pricing;
pub mod telemetry;
pub mod timeseries;

#[cfg(test)]
pub mod testutil;
