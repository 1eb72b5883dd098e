//! In-memory `ClusterStore` used by the reconciler tests.

use super::{ClusterNodeInfo, ClusterStore, Vault, Wgnode};
use crate::error::Error;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, Wgnode>,
    vault: Option<Vault>,
    cluster_nodes: BTreeMap<String, ClusterNodeInfo>,
    kubeadm_subnet: Option<String>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_record(&self, record: Wgnode) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(record.name_any(), record);
    }

    pub fn remove_record(&self, name: &str) {
        self.state.lock().unwrap().records.remove(name);
    }

    pub fn record_names(&self) -> Vec<String> {
        self.state.lock().unwrap().records.keys().cloned().collect()
    }

    pub fn record(&self, name: &str) -> Option<Wgnode> {
        self.state.lock().unwrap().records.get(name).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn insert_cluster_node(&self, name: &str, info: ClusterNodeInfo) {
        let mut state = self.state.lock().unwrap();
        state.cluster_nodes.insert(name.to_string(), info);
    }

    pub fn set_vault(&self, vault: Vault) {
        self.state.lock().unwrap().vault = Some(vault);
    }

    pub fn vault(&self) -> Vault {
        self.state.lock().unwrap().vault.clone().unwrap_or_default()
    }

    pub fn set_kubeadm_subnet(&self, cidr: &str) {
        self.state.lock().unwrap().kubeadm_subnet = Some(cidr.to_string());
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn start_watching(
        &self,
        _signal: flume::Sender<()>,
        _shutdown: CancellationToken,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn list_node_records(&self) -> Result<Vec<Wgnode>, Error> {
        Ok(self.state.lock().unwrap().records.values().cloned().collect())
    }

    async fn publish_node_record(&self, record: &Wgnode) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.records.insert(record.name_any(), record.clone());
        Ok(())
    }

    async fn delete_node_record(&self, name: &str) -> Result<(), Error> {
        self.state.lock().unwrap().records.remove(name);
        Ok(())
    }

    async fn init_vault(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.vault.is_none() {
            state.vault = Some(Vault::new());
        }
        Ok(())
    }

    async fn read_vault(&self) -> Result<Vault, Error> {
        self.state
            .lock()
            .unwrap()
            .vault
            .clone()
            .ok_or_else(|| Error::NotFound(format!("secret {}", super::VAULT_SECRET_NAME)))
    }

    async fn write_vault(&self, vault: Vault) -> Result<(), Error> {
        self.state.lock().unwrap().vault = Some(vault);
        Ok(())
    }

    async fn cluster_node(&self, name: &str) -> Result<Option<ClusterNodeInfo>, Error> {
        Ok(self.state.lock().unwrap().cluster_nodes.get(name).cloned())
    }

    async fn pod_node_name(&self, namespace: &str, pod: &str) -> Result<String, Error> {
        Err(Error::NotFound(format!("pod {namespace}/{pod}")))
    }

    async fn kubeadm_pod_subnet(&self) -> Result<String, Error> {
        self.state
            .lock()
            .unwrap()
            .kubeadm_subnet
            .clone()
            .ok_or_else(|| Error::NotFound("configmap kube-system/kubeadm-config".into()))
    }
}
