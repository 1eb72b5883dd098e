mod resources;

pub use resources::{Wgnode, WgnodeSpec, WgnodeStatus};

#[cfg(test)]
pub(crate) mod memory;

use crate::error::Error;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Name of the secret object holding every pair's pre-shared key.
pub const VAULT_SECRET_NAME: &str = "wireguard-shared-secrets";

/// The shared-secret vault payload: pair key -> pre-shared key bytes.
pub type Vault = BTreeMap<String, Vec<u8>>;

/// What wormhole needs to know about the backing cluster node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterNodeInfo {
    pub pod_cidr: Option<String>,
    pub internal_addr: Option<Ipv4Addr>,
    pub external_addr: Option<Ipv4Addr>,
}

impl ClusterNodeInfo {
    /// Internal addresses are reachable from every node in the common case;
    /// external ones are the fallback.
    pub fn preferred_endpoint(&self) -> Option<Ipv4Addr> {
        self.internal_addr.or(self.external_addr)
    }
}

/// Access to the shared cluster state, kept narrow so the reconciler can be
/// exercised against an in-memory implementation.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Spawns the change-feed tasks. Every observed change lands in the
    /// single-slot `signal` channel; a full slot means a resync is already
    /// pending and the event can be dropped.
    async fn start_watching(
        &self,
        signal: flume::Sender<()>,
        shutdown: CancellationToken,
    ) -> Result<(), Error>;

    /// Blocks until the initial list of both watched collections completed.
    async fn wait_for_sync(&self) -> Result<(), Error>;

    async fn list_node_records(&self) -> Result<Vec<Wgnode>, Error>;

    /// Upsert: create, and on AlreadyExists re-fetch and replace.
    async fn publish_node_record(&self, record: &Wgnode) -> Result<(), Error>;

    async fn delete_node_record(&self, name: &str) -> Result<(), Error>;

    /// Creates the vault object if it does not exist yet.
    async fn init_vault(&self) -> Result<(), Error>;

    async fn read_vault(&self) -> Result<Vault, Error>;

    /// Replaces the vault payload. Last writer wins; a lost write is healed
    /// by the next reconcile on the other side.
    async fn write_vault(&self, vault: Vault) -> Result<(), Error>;

    /// Existence and addressing of the backing cluster node, as opposed to
    /// the wormhole NodeRecord.
    async fn cluster_node(&self, name: &str) -> Result<Option<ClusterNodeInfo>, Error>;

    async fn pod_node_name(&self, namespace: &str, pod: &str) -> Result<String, Error>;

    /// The overlay range as recorded in the kubeadm cluster configuration.
    async fn kubeadm_pod_subnet(&self) -> Result<String, Error>;
}

/// Production store backed by the kubernetes API.
pub struct KubeStore {
    client: Client,
    namespace: String,
    nodes_synced: watch::Sender<bool>,
    vault_synced: watch::Sender<bool>,
}

impl KubeStore {
    /// Builds a client from an explicit kubeconfig path, or infers the
    /// configuration from the pod environment.
    pub async fn new(kubeconfig: Option<&Path>, namespace: &str) -> Result<Self, Error> {
        let config = match kubeconfig {
            Some(path) => {
                let kc =
                    Kubeconfig::read_from(path).map_err(|e| Error::Kubeconfig(e.to_string()))?;
                kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::Kubeconfig(e.to_string()))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::Kubeconfig(e.to_string()))?,
        };
        let client = Client::try_from(config)?;

        Ok(Self {
            client,
            namespace: namespace.to_string(),
            nodes_synced: watch::Sender::new(false),
            vault_synced: watch::Sender::new(false),
        })
    }

    fn wgnodes(&self) -> Api<Wgnode> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn watch_loop<K, S>(
        what: &'static str,
        stream: S,
        synced: watch::Sender<bool>,
        signal: flume::Sender<()>,
        shutdown: CancellationToken,
    ) where
        K: Send + 'static,
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    {
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    trace!(what, "watcher cancelled");
                    break;
                }
                event = stream.next() => match event {
                    None => {
                        warn!(what, "watch stream ended");
                        break;
                    }
                    Some(Ok(event)) => {
                        if matches!(event, watcher::Event::InitDone) {
                            let _ = synced.send(true);
                        }
                        // coalesce: a full slot already means "resync pending"
                        let _ = signal.try_send(());
                    }
                    Some(Err(e)) => warn!(what, error = %e, "watch error"),
                },
            }
        }
    }

    async fn wait_flag(flag: &watch::Sender<bool>, what: &str) -> Result<(), Error> {
        let mut rx = flag.subscribe();
        rx.wait_for(|synced| *synced)
            .await
            .map_err(|_| Error::System(format!("{what} watcher terminated")))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn start_watching(
        &self,
        signal: flume::Sender<()>,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let nodes_stream =
            watcher(self.wgnodes(), watcher::Config::default()).default_backoff();
        tokio::spawn(Self::watch_loop(
            "wgnodes",
            nodes_stream,
            self.nodes_synced.clone(),
            signal.clone(),
            shutdown.clone(),
        ));

        let vault_config =
            watcher::Config::default().fields(&format!("metadata.name={VAULT_SECRET_NAME}"));
        let vault_stream = watcher(self.secrets(), vault_config).default_backoff();
        tokio::spawn(Self::watch_loop(
            "vault",
            vault_stream,
            self.vault_synced.clone(),
            signal,
            shutdown,
        ));

        Ok(())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        Self::wait_flag(&self.nodes_synced, "wgnode").await?;
        Self::wait_flag(&self.vault_synced, "vault").await
    }

    async fn list_node_records(&self) -> Result<Vec<Wgnode>, Error> {
        let list = self.wgnodes().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn publish_node_record(&self, record: &Wgnode) -> Result<(), Error> {
        let api = self.wgnodes();
        match api.create(&PostParams::default(), record).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if !e.is_already_exists() {
                    return Err(e);
                }
                let name = record.name_any();
                let mut existing = api.get(&name).await.map_err(Error::from)?;
                existing.status = record.status.clone();
                api.replace(&name, &PostParams::default(), &existing)
                    .await
                    .map_err(Error::from)?;
                Ok(())
            }
        }
    }

    async fn delete_node_record(&self, name: &str) -> Result<(), Error> {
        match self.wgnodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                // already gone, some other agent got there first
                if e.is_not_found() { Ok(()) } else { Err(e) }
            }
        }
    }

    async fn init_vault(&self) -> Result<(), Error> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(VAULT_SECRET_NAME.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.secrets().create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_already_exists() { Ok(()) } else { Err(e) }
            }
        }
    }

    async fn read_vault(&self) -> Result<Vault, Error> {
        let secret = self.secrets().get(VAULT_SECRET_NAME).await?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, ByteString(v))| (k, v))
            .collect())
    }

    async fn write_vault(&self, vault: Vault) -> Result<(), Error> {
        let api = self.secrets();
        let mut secret = api.get(VAULT_SECRET_NAME).await?;
        secret.data = Some(vault.into_iter().map(|(k, v)| (k, ByteString(v))).collect());
        api.replace(VAULT_SECRET_NAME, &PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn cluster_node(&self, name: &str) -> Result<Option<ClusterNodeInfo>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(|node| node_info(&node)))
    }

    async fn pod_node_name(&self, namespace: &str, pod: &str) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_object = api.get(pod).await?;
        pod_object
            .spec
            .and_then(|spec| spec.node_name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::BadParameter(format!("node name not present in pod spec {namespace}/{pod}"))
            })
    }

    async fn kubeadm_pod_subnet(&self) -> Result<String, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), "kube-system");
        let config = api.get("kubeadm-config").await?;
        let cluster_configuration = config
            .data
            .as_ref()
            .and_then(|data| data.get("ClusterConfiguration"))
            .ok_or_else(|| {
                Error::BadParameter("kubeadm configmap is missing ClusterConfiguration".into())
            })?;
        parse_kubeadm_pod_subnet(cluster_configuration)
    }
}

/// Extracts the pod CIDR and the first IPv4 internal/external address from a
/// cluster node object.
pub fn node_info(node: &Node) -> ClusterNodeInfo {
    let mut info = ClusterNodeInfo {
        pod_cidr: node.spec.as_ref().and_then(|spec| spec.pod_cidr.clone()),
        ..Default::default()
    };

    for addr in node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .into_iter()
        .flatten()
    {
        let Ok(ip) = addr.address.parse::<Ipv4Addr>() else {
            continue;
        };
        match addr.type_.as_str() {
            "InternalIP" => info.internal_addr.get_or_insert(ip),
            "ExternalIP" => info.external_addr.get_or_insert(ip),
            _ => continue,
        };
    }

    info
}

#[derive(Deserialize)]
struct KubeadmClusterConfiguration {
    networking: HashMap<String, String>,
}

/// Pulls `networking.podSubnet` out of a kubeadm ClusterConfiguration blob.
pub fn parse_kubeadm_pod_subnet(cluster_configuration: &str) -> Result<String, Error> {
    let parsed: KubeadmClusterConfiguration = serde_yaml::from_str(cluster_configuration)
        .map_err(|e| Error::BadParameter(format!("invalid kubeadm configuration: {e}")))?;

    let Some(cidr) = parsed.networking.get("podSubnet") else {
        return Err(Error::BadParameter(format!(
            "unable to locate networking.podSubnet in kubeadm config: {cluster_configuration}"
        )));
    };

    cidr.parse::<ipnet::IpNet>()
        .map_err(|e| Error::BadParameter(format!("invalid podSubnet {cidr}: {e}")))?;
    Ok(cidr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};

    fn node_with(addresses: Vec<(&str, &str)>) -> Node {
        Node {
            spec: Some(NodeSpec {
                pod_cidr: Some("10.20.1.0/24".into()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .into_iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: type_.into(),
                            address: address.into(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_info_prefers_internal() {
        let info = node_info(&node_with(vec![
            ("InternalIP", "10.0.0.3"),
            ("ExternalIP", "10.0.0.4"),
        ]));
        assert_eq!(info.preferred_endpoint().unwrap().to_string(), "10.0.0.3");
        assert_eq!(info.pod_cidr.as_deref(), Some("10.20.1.0/24"));
    }

    #[test]
    fn test_node_info_falls_back_to_external() {
        let info = node_info(&node_with(vec![("ExternalIP", "10.0.0.2")]));
        assert_eq!(info.preferred_endpoint().unwrap().to_string(), "10.0.0.2");
    }

    #[test]
    fn test_node_info_skips_non_ipv4() {
        let info = node_info(&node_with(vec![
            ("InternalIP", "::1"),
            ("ExternalIP", "::2"),
            ("InternalIP", "10.0.0.5"),
            ("ExternalIP", "10.0.0.6"),
        ]));
        assert_eq!(info.preferred_endpoint().unwrap().to_string(), "10.0.0.5");
        assert_eq!(info.external_addr.unwrap().to_string(), "10.0.0.6");
    }

    #[test]
    fn test_node_info_no_addresses() {
        let info = node_info(&node_with(vec![]));
        assert_eq!(info.preferred_endpoint(), None);
    }

    #[test]
    fn test_parse_kubeadm_pod_subnet() {
        let config = "\
networking:
  dnsDomain: cluster.local
  podSubnet: 10.20.0.0/16
  serviceSubnet: 10.99.0.0/24";
        assert_eq!(parse_kubeadm_pod_subnet(config).unwrap(), "10.20.0.0/16");
    }

    #[test]
    fn test_parse_kubeadm_pod_subnet_errors() {
        for (config, description) in [
            ("derp: true", "missing networking"),
            (
                "networking:\n  dnsDomain: cluster.local\n  podSubnet: broken",
                "invalid cidr",
            ),
            ("\tnetworking:\n\t", "invalid yaml"),
        ] {
            assert!(
                parse_kubeadm_pod_subnet(config).is_err(),
                "{description}: expected error"
            );
        }
    }
}
