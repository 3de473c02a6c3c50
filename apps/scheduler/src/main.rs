use anyhow::{Context, Result};
use clap::Parser;
use compute_gardener_scheduler::admission::AdmissionEngine;
use compute_gardener_scheduler::carbon::cache::{CacheCleanupService, CarbonCache};
use compute_gardener_scheduler::carbon::client::ElectricityMapsClient;
use compute_gardener_scheduler::carbon::CarbonDataSource;
use compute_gardener_scheduler::clock::{Clock, SystemClock};
use compute_gardener_scheduler::config::SchedulerConfig;
use compute_gardener_scheduler::deferral::DeferralSets;
use compute_gardener_scheduler::extender::{router, ExtenderState};
use compute_gardener_scheduler::hardware::{
    HardwareProfiler, MeasuredPowerFeed, MeasuredPowerService,
};
use compute_gardener_scheduler::health::{HealthCheckService, HealthState};
use compute_gardener_scheduler::kubeutil::{ClusterPatcher, KubeClusterPatcher};
use compute_gardener_scheduler::pricing::{PriceOracle, TouPriceOracle};
use compute_gardener_scheduler::telemetry::budget::EnergyBudgetService;
use compute_gardener_scheduler::telemetry::clients::{
    GpuMetricsClient, MetricsApiClient, PrometheusGpuClient,
};
use compute_gardener_scheduler::telemetry::collector::CollectorService;
use compute_gardener_scheduler::telemetry::completion::CompletionHandler;
use compute_gardener_scheduler::telemetry::counterfactual::CounterfactualEstimator;
use compute_gardener_scheduler::telemetry::downsample::strategy_for;
use compute_gardener_scheduler::telemetry::informer::PodWatchService;
use compute_gardener_scheduler::telemetry::store::{InMemoryStore, StoreCleanupService};
use compute_gardener_scheduler::telemetry::PodMetricsStorage;
use compute_gardener_scheduler::timeseries::{PrometheusClient, TimeSeriesClient};
use compute_gardener_scheduler::cli::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing();

    let mut config = SchedulerConfig::load(args.config.as_deref())?;
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }
    let config = Arc::new(config);
    info!(
        scheduler = %config.scheduler_name,
        carbon = config.carbon.enabled,
        pricing = config.pricing.enabled,
        hardware = config.hardware.enabled,
        "starting scheduler extender"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to build cluster client")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cancel = CancellationToken::new();

    let timeseries: Option<Arc<dyn TimeSeriesClient>> = match config.timeseries.as_ref() {
        Some(ts_config) => Some(Arc::new(PrometheusClient::new(
            &ts_config.prometheus_url,
            Duration::from_secs(ts_config.timeout_seconds),
        )?)),
        None => None,
    };

    let cache = Arc::new(CarbonCache::new(
        Duration::from_secs(config.carbon.cache_ttl_seconds),
        Duration::from_secs(config.carbon.cache_max_age_seconds),
        clock.clone(),
    ));
    CacheCleanupService::new(
        cache.clone(),
        Duration::from_secs(config.carbon.cache_cleanup_seconds),
    )
    .start(cancel.clone());

    let health = Arc::new(HealthState::new());
    let carbon: Option<Arc<dyn CarbonDataSource>> = if config.carbon.enabled {
        let source: Arc<dyn CarbonDataSource> = Arc::new(ElectricityMapsClient::new(
            config.carbon.clone(),
            cache.clone(),
            clock.clone(),
        )?);
        HealthCheckService::new(
            source.clone(),
            config.carbon.region.clone(),
            health.clone(),
            Duration::from_secs(config.carbon.health_check_seconds),
        )
        .start(cancel.clone());
        Some(source)
    } else {
        None
    };

    let oracle: Option<Arc<dyn PriceOracle>> = if config.pricing.enabled {
        Some(Arc::new(TouPriceOracle::from_config(&config.pricing)?))
    } else {
        None
    };

    let profiler: Option<Arc<HardwareProfiler>> = if config.hardware.enabled {
        let measured_feed = match (
            config.hardware.measured_power_metric.as_ref(),
            timeseries.as_ref(),
        ) {
            (Some(metric), Some(ts)) => {
                let feed = Arc::new(MeasuredPowerFeed::new());
                MeasuredPowerService::new(
                    feed.clone(),
                    ts.clone(),
                    metric.clone(),
                    Duration::from_secs(300),
                )
                .start(cancel.clone());
                Some(feed)
            }
            _ => None,
        };
        let frequency_metric = config
            .timeseries
            .as_ref()
            .map(|ts| ts.cpu_frequency_metric.clone())
            .unwrap_or_else(|| "node_cpu_frequency_ghz".to_string());
        Some(Arc::new(HardwareProfiler::with_default_providers(
            config.hardware.clone(),
            measured_feed,
            timeseries.clone(),
            frequency_metric,
        )))
    } else {
        None
    };

    let store: Arc<dyn PodMetricsStorage> = Arc::new(InMemoryStore::new(
        config.telemetry.max_records_per_pod,
        Duration::from_secs(config.telemetry.completed_retention_seconds),
        strategy_for(config.telemetry.downsampling),
        clock.clone(),
    ));
    StoreCleanupService::new(
        store.clone(),
        Duration::from_secs(config.telemetry.cleanup_interval_seconds),
    )
    .start(cancel.clone());

    let deferral = Arc::new(DeferralSets::new());
    let patcher: Arc<dyn ClusterPatcher> = Arc::new(KubeClusterPatcher::new(client.clone()));

    let estimator = match (timeseries.as_ref(), config.carbon.enabled) {
        (Some(ts), true) => {
            let metric = config
                .timeseries
                .as_ref()
                .map(|ts_config| ts_config.carbon_intensity_metric.clone())
                .unwrap_or_else(|| "carbon_intensity".to_string());
            Some(Arc::new(CounterfactualEstimator::new(
                ts.clone(),
                metric,
                config.carbon.region.clone(),
            )))
        }
        _ => None,
    };

    let completion = Arc::new(CompletionHandler::new(
        store.clone(),
        deferral.clone(),
        patcher.clone(),
        estimator,
        config.carbon.enabled,
        Duration::from_secs(config.telemetry.completion_delay_seconds),
    ));

    let gpu_metrics: Option<Arc<dyn GpuMetricsClient>> = timeseries.as_ref().map(|ts| {
        let metric = config
            .timeseries
            .as_ref()
            .map(|ts_config| ts_config.gpu_power_metric.clone())
            .unwrap_or_else(|| "DCGM_FI_DEV_POWER_USAGE".to_string());
        Arc::new(PrometheusGpuClient::new(ts.clone(), metric)) as Arc<dyn GpuMetricsClient>
    });
    CollectorService::new(
        config.clone(),
        clock.clone(),
        client.clone(),
        cache.clone(),
        oracle.clone(),
        profiler.clone(),
        store.clone(),
        Arc::new(MetricsApiClient::new(client.clone())),
        gpu_metrics,
        completion.clone(),
    )
    .start(cancel.clone());

    PodWatchService::new(
        client.clone(),
        config.scheduler_name.clone(),
        completion.clone(),
    )
    .start(cancel.clone());

    EnergyBudgetService::new(
        client.clone(),
        store.clone(),
        patcher.clone(),
        config.scheduler_name.clone(),
        Duration::from_secs(config.telemetry.budget_check_seconds),
    )
    .start(cancel.clone());

    let engine = Arc::new(AdmissionEngine::new(
        config.clone(),
        clock,
        carbon,
        oracle,
        profiler,
        patcher.clone(),
        deferral,
    ));

    let app = router(ExtenderState {
        engine,
        health,
        patcher,
    });
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind extender listener on {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "extender listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    store.close();
    cache.close();
    Ok(())
}
