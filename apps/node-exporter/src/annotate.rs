use crate::cpuinfo::CpuInventory;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use std::collections::BTreeMap;
use tracing::info;

pub const CPU_MODEL: &str = "compute-gardener-scheduler.kubernetes.io/cpu-model";
pub const CPU_BASE_FREQUENCY: &str =
    "compute-gardener-scheduler.kubernetes.io/cpu-base-frequency";
pub const CPU_MIN_FREQUENCY: &str = "compute-gardener-scheduler.kubernetes.io/cpu-min-frequency";
pub const CPU_MAX_FREQUENCY: &str = "compute-gardener-scheduler.kubernetes.io/cpu-max-frequency";

/// What gets written onto the node object: model string plus the static
/// frequency endpoints of cpu0, which is representative on homogeneous
/// sockets.
pub fn build_annotations(inventory: &CpuInventory) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    if let Some(model) = inventory.model.as_ref() {
        annotations.insert(CPU_MODEL.to_string(), model.clone());
    }
    if let Some(first) = inventory.cpus.first() {
        if let Some(base) = first.base_ghz {
            annotations.insert(CPU_BASE_FREQUENCY.to_string(), format!("{base:.3}"));
        }
        if let Some(min) = first.min_ghz {
            annotations.insert(CPU_MIN_FREQUENCY.to_string(), format!("{min:.3}"));
        }
        if let Some(max) = first.max_ghz {
            annotations.insert(CPU_MAX_FREQUENCY.to_string(), format!("{max:.3}"));
        }
    }
    annotations
}

pub async fn annotate_node(
    client: kube::Client,
    node_name: &str,
    inventory: &CpuInventory,
) -> Result<()> {
    let annotations = build_annotations(inventory);
    if annotations.is_empty() {
        info!(node = node_name, "nothing to annotate");
        return Ok(());
    }
    let keys = annotations.len();
    let api: Api<Node> = Api::all(client);
    let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
    api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("failed to annotate node {node_name}"))?;
    info!(node = node_name, keys, "node annotated");
    Ok(())
}
