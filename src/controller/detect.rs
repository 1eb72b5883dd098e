//! One-shot discovery of the agent's identity and address ranges.

use crate::error::Error;
use crate::kube::ClusterStore;
use std::env;
use std::fs;
use tracing::{debug, info};

/// Environment file present on hosts provisioned with a pod subnet, checked
/// before falling back to the kubeadm cluster configuration.
const CONTAINER_ENVIRONMENT_FILE: &str = "/etc/container-environment";

pub fn running_in_pod() -> bool {
    env::var("POD_NAME").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Resolves the cluster node name: the pod's assigned node when running in a
/// pod, the hostname otherwise.
pub async fn detect_node_name(store: &dyn ClusterStore) -> Result<String, Error> {
    debug!("attempting to detect node name");

    let pod_name = env::var("POD_NAME").unwrap_or_default();
    let pod_namespace = env::var("POD_NAMESPACE").unwrap_or_default();
    if !pod_name.is_empty() && !pod_namespace.is_empty() {
        let node_name = store.pod_node_name(&pod_namespace, &pod_name).await?;
        info!(node_name, "detected node name from pod");
        return Ok(node_name);
    }

    let node_name = hostname::get()?
        .into_string()
        .map_err(|name| Error::BadParameter(format!("hostname is not valid utf-8: {name:?}")))?;
    info!(node_name, "detected node name from hostname");
    Ok(node_name)
}

/// Resolves the overlay network range: the host environment file first, the
/// kubeadm cluster configuration second.
pub async fn detect_overlay_cidr(store: &dyn ClusterStore) -> Result<String, Error> {
    info!("attempting to detect overlay network address range");

    match fs::read_to_string(CONTAINER_ENVIRONMENT_FILE) {
        Ok(contents) => match parse_pod_subnet_env(&contents) {
            Ok(cidr) => return Ok(cidr),
            Err(e) => info!(error = %e, "unable to load overlay network from host environment"),
        },
        Err(e) => debug!(error = %e, "no host environment file"),
    }

    store.kubeadm_pod_subnet().await
}

/// Extracts `KUBE_POD_SUBNET` from an environment file. Values may be
/// double-quoted; keys and values may carry surrounding whitespace.
pub fn parse_pod_subnet_env(contents: &str) -> Result<String, Error> {
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() != "KUBE_POD_SUBNET" {
            continue;
        }

        let value = value.trim();
        let value = if let Some(quoted) = value.strip_prefix('"') {
            quoted.strip_suffix('"').ok_or_else(|| {
                Error::BadParameter(format!("unterminated quote in KUBE_POD_SUBNET: {value}"))
            })?
        } else {
            value
        };

        value
            .parse::<ipnet::IpNet>()
            .map_err(|e| Error::BadParameter(format!("invalid KUBE_POD_SUBNET {value:?}: {e}")))?;
        return Ok(value.to_string());
    }

    Err(Error::NotFound(format!(
        "unable to locate KUBE_POD_SUBNET in {CONTAINER_ENVIRONMENT_FILE}"
    )))
}
