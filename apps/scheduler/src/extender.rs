use crate::admission::{AdmissionEngine, Status};
use crate::health::HealthState;
use crate::kubeutil::ClusterPatcher;
use crate::metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Scheduler-extender wire shapes; field names follow the upstream
/// convention so a stock kube-scheduler policy can point here unchanged.
#[derive(Debug, Deserialize)]
pub struct ExtenderArgs {
    #[serde(rename = "Pod")]
    pub pod: Pod,
    #[serde(rename = "Nodes", default)]
    pub nodes: Option<NodeListPayload>,
    #[serde(rename = "NodeNames", default)]
    pub node_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct NodeListPayload {
    #[serde(default)]
    pub items: Vec<Node>,
}

#[derive(Debug, Serialize, Default)]
pub struct ExtenderFilterResult {
    #[serde(rename = "NodeNames", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    #[serde(rename = "FailedNodes")]
    pub failed_nodes: HashMap<String, String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreFilterResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindNotification {
    #[serde(rename = "PodName")]
    pub pod_name: String,
    #[serde(rename = "PodNamespace")]
    pub pod_namespace: String,
}

#[derive(Clone)]
pub struct ExtenderState {
    pub engine: Arc<AdmissionEngine>,
    pub health: Arc<HealthState>,
    pub patcher: Arc<dyn ClusterPatcher>,
}

pub fn router(state: ExtenderState) -> Router {
    Router::new()
        .route("/prefilter", post(prefilter))
        .route("/filter", post(filter))
        .route("/postbind", post(postbind))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn status_name(status: &Status) -> &'static str {
    match status {
        Status::Success(_) => "Success",
        Status::Unschedulable(_) => "Unschedulable",
        Status::Error(_) => "Error",
    }
}

async fn prefilter(
    State(state): State<ExtenderState>,
    Json(args): Json<ExtenderArgs>,
) -> Json<PreFilterResponse> {
    let status = state.engine.pre_filter(&args.pod).await;
    Json(PreFilterResponse {
        status: status_name(&status),
        message: status.message().map(str::to_string),
    })
}

/// The extender filter verb: PreFilter once for the pod, then the node
/// filter for every candidate.
async fn filter(
    State(state): State<ExtenderState>,
    Json(args): Json<ExtenderArgs>,
) -> Json<ExtenderFilterResult> {
    let mut result = ExtenderFilterResult::default();

    match state.engine.pre_filter(&args.pod).await {
        Status::Success(_) => {}
        Status::Unschedulable(message) => {
            // Every candidate fails with the same deferral message; the pod
            // stays pending and is retried next cycle.
            if let Some(nodes) = args.nodes.as_ref() {
                for node in &nodes.items {
                    if let Some(name) = node.metadata.name.clone() {
                        result.failed_nodes.insert(name, message.clone());
                    }
                }
            }
            for name in args.node_names.unwrap_or_default() {
                result.failed_nodes.entry(name).or_insert_with(|| message.clone());
            }
            result.node_names = Some(Vec::new());
            return Json(result);
        }
        Status::Error(message) => {
            result.error = Some(message);
            return Json(result);
        }
    }

    let mut passing = Vec::new();
    if let Some(nodes) = args.nodes.as_ref() {
        for node in &nodes.items {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            match state.engine.filter(&args.pod, node).await {
                Status::Success(_) => passing.push(name),
                Status::Unschedulable(message) => {
                    result.failed_nodes.insert(name, message);
                }
                Status::Error(message) => {
                    result.error = Some(message);
                    return Json(result);
                }
            }
        }
    } else {
        // Name-only invocations carry no node objects to profile; pass them
        // through untouched.
        passing = args.node_names.unwrap_or_default();
    }

    result.node_names = Some(passing);
    Json(result)
}

async fn postbind(
    State(state): State<ExtenderState>,
    Json(notification): Json<BindNotification>,
) -> StatusCode {
    match state
        .patcher
        .get_pod(&notification.pod_namespace, &notification.pod_name)
        .await
    {
        Ok(Some(pod)) => {
            state.engine.post_bind(&pod).await;
            StatusCode::OK
        }
        Ok(None) => StatusCode::NOT_FOUND,
        Err(err) => {
            warn!(
                pod = %notification.pod_name,
                "postbind lookup failed: {err:#}"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn healthz(State(state): State<ExtenderState>) -> impl IntoResponse {
    if state.health.healthy() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "carbon": state.health.last_error(),
            })),
        )
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extender_args_accept_upstream_field_names() {
        let raw = r#"{
            "Pod": {"metadata": {"name": "job-a", "uid": "uid-a"}},
            "NodeNames": ["node-1", "node-2"]
        }"#;
        let args: ExtenderArgs = serde_json::from_str(raw).expect("parse");
        assert_eq!(args.pod.metadata.name.as_deref(), Some("job-a"));
        assert_eq!(args.node_names.as_deref().unwrap().len(), 2);
    }

    #[test]
    fn filter_result_serializes_failed_nodes() {
        let mut result = ExtenderFilterResult::default();
        result
            .failed_nodes
            .insert("node-1".to_string(), "too dirty".to_string());
        let raw = serde_json::to_string(&result).expect("serialize");
        assert!(raw.contains("FailedNodes"));
        assert!(raw.contains("too dirty"));
    }
}
