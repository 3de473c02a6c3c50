use crate::kubeutil;
use crate::telemetry::completion::CompletionHandler;
use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchParams};
use kube::core::WatchEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Watches pod transitions and hands terminal ones to the completion
/// handler as they happen. The collector's heartbeat remains the backstop
/// for events this watch misses.
pub struct PodWatchService {
    client: kube::Client,
    scheduler_name: String,
    completion: Arc<CompletionHandler>,
}

impl PodWatchService {
    pub fn new(
        client: kube::Client,
        scheduler_name: String,
        completion: Arc<CompletionHandler>,
    ) -> Self {
        Self {
            client,
            scheduler_name,
            completion,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.run_once() => {
                        if let Err(err) = result {
                            warn!("pod watch interrupted: {err:#}");
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    async fn run_once(&self) -> Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().limit(1)).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();

        let mut stream = api
            .watch(&WatchParams::default(), &resource_version)
            .await?
            .boxed();
        while let Some(event) = stream.try_next().await? {
            match event {
                WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                    self.maybe_settle(&pod, kubeutil::is_terminal(&pod)).await;
                }
                WatchEvent::Deleted(pod) => {
                    self.maybe_settle(&pod, true).await;
                }
                WatchEvent::Bookmark(_) => {}
                WatchEvent::Error(err) => {
                    warn!(code = err.code, "pod watch error event: {}", err.message);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn maybe_settle(&self, pod: &Pod, terminal: bool) {
        if !terminal || kubeutil::scheduler_name(pod) != self.scheduler_name {
            return;
        }
        let uid = kubeutil::pod_uid(pod);
        if uid.is_empty() {
            return;
        }
        debug!(pod = kubeutil::pod_name(pod), "watch observed terminal pod");
        self.completion.process(uid, Some(pod)).await;
    }
}
