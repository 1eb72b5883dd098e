mod detect;

pub use detect::{detect_node_name, detect_overlay_cidr, parse_pod_subnet_env, running_in_pod};

use crate::cni;
use crate::error::Error;
use crate::firewall::{Firewall, SystemDriver};
use crate::ipam;
use crate::kube::{ClusterStore, Wgnode, WgnodeStatus};
use crate::wireguard::{Peer, Tunnel, TunnelInterface, WgCli};
use ipnet::Ipv4Net;
use kube::ResourceExt;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a full resync runs without any watch event arriving.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Target interval between node-deletion scans, per known node, so the scan
/// load does not grow with the cluster.
const NODE_SLEEP_INTERVAL: Duration = Duration::from_secs(60);

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_TOTAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the cluster node this agent runs on; detected when unset.
    pub node_name: Option<String>,
    /// Namespace holding the wormhole state objects.
    pub namespace: String,
    /// Address range of the entire overlay network; detected when unset.
    pub overlay_cidr: Option<String>,
    /// Address range assigned to this node; read from the cluster node
    /// object when unset.
    pub node_cidr: Option<String>,
    /// Address other nodes reach this node's tunnel on; read from the
    /// cluster node object when unset.
    pub endpoint: Option<String>,
    /// UDP port wireguard listens on.
    pub listen_port: u16,
    /// Name of the wireguard interface to create.
    pub wireguard_iface: String,
    /// Name of the linux bridge the CNI plugin creates.
    pub bridge_iface: String,
    /// MTU written into the CNI configuration.
    pub bridge_mtu: u16,
    pub resync_period: Duration,
}

/// The agent entry point: resolves configuration, programs the host, then
/// hands control to the reconciler.
pub struct Controller {
    config: Config,
    store: Arc<dyn ClusterStore>,
}

impl Controller {
    pub fn new(config: Config, store: Arc<dyn ClusterStore>) -> Self {
        Self { config, store }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        info!("initializing wormhole");
        let Self { config, store } = self;

        cni::sync_cni_bin()?;

        let node_name = match config.node_name.clone() {
            Some(name) => name,
            None => detect_node_name(store.as_ref()).await?,
        };
        let overlay_cidr = match config.overlay_cidr.clone() {
            Some(cidr) => cidr,
            None => detect_overlay_cidr(store.as_ref()).await?,
        };
        let overlay_network: Ipv4Net = overlay_cidr
            .parse()
            .map_err(|e| Error::BadParameter(format!("invalid overlay CIDR {overlay_cidr}: {e}")))?;

        let cluster_node = store
            .cluster_node(&node_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cluster node {node_name}")))?;
        let node_cidr = match config.node_cidr.clone() {
            Some(cidr) => cidr,
            None => cluster_node.pod_cidr.clone().ok_or_else(|| {
                Error::BadParameter(format!("node/{node_name} node.spec.podCIDR is missing"))
            })?,
        };
        let endpoint = match config.endpoint.clone() {
            Some(endpoint) => endpoint,
            None => cluster_node
                .preferred_endpoint()
                .map(|ip| ip.to_string())
                .ok_or_else(|| {
                    Error::BadParameter(format!("node/{node_name} has no usable IPv4 address"))
                })?,
        };

        let ipam_info = ipam::derive(&node_cidr)?;

        info!("running wormhole controller");
        info!("  node name:                   {node_name}");
        info!("  port:                        {}", config.listen_port);
        info!("  overlay network:             {overlay_cidr}");
        info!("  node network:                {node_cidr}");
        info!("  endpoint:                    {endpoint}");
        info!("  wireguard interface name:    {}", config.wireguard_iface);
        info!("  wireguard interface address: {}", ipam_info.wireguard_addr);
        info!("  bridge interface name:       {}", config.bridge_iface);
        info!("  bridge interface address:    {}", ipam_info.bridge_addr);
        info!("  pod address start:           {}", ipam_info.pod_addr_start);
        info!("  pod address end:             {}", ipam_info.pod_addr_end);
        info!("  resync period:               {:?}", config.resync_period);

        let tunnel = Arc::new(
            Tunnel::new(
                crate::wireguard::Config {
                    interface_name: config.wireguard_iface.clone(),
                    ip: ipam_info.wireguard_addr.to_string(),
                    listen_port: config.listen_port,
                    overlay_networks: vec![overlay_network],
                },
                Arc::new(WgCli::new(&config.wireguard_iface)),
            )
            .await?,
        );

        let firewall = Arc::new(Firewall::new(
            crate::firewall::Config {
                overlay_cidr: overlay_cidr.clone(),
                pod_cidr: node_cidr.clone(),
                wireguard_iface: config.wireguard_iface.clone(),
                bridge_iface: config.bridge_iface.clone(),
                sync_interval: config.resync_period,
            },
            Arc::new(SystemDriver::new()?),
        ));
        firewall.bootstrap()?;

        let mut tasks = JoinSet::new();
        tasks.spawn(firewall.run(shutdown.child_token()));

        cni::write_config(
            &config.bridge_iface,
            config.bridge_mtu,
            &node_cidr,
            &ipam_info,
            running_in_pod(),
        )?;

        store.init_vault().await?;

        let reconciler = Arc::new(Reconciler {
            node_name,
            listen_port: config.listen_port,
            node_cidr,
            endpoint,
            resync_period: config.resync_period,
            store: store.clone(),
            tunnel,
        });
        reconciler.publish_node_record().await?;

        let (signal_tx, signal_rx) = flume::bounded(1);
        store
            .start_watching(signal_tx, shutdown.child_token())
            .await?;

        tokio::select! {
            synced = store.wait_for_sync() => synced?,
            _ = shutdown.cancelled() => return Ok(()),
        }
        debug!("cluster store watchers synced");

        // rotate every pair secret this node shares; peers converge once
        // they observe the vault change
        with_backoff(|| reconciler.update_peer_secrets(true)).await?;

        tasks.spawn(Reconciler::gc_runner(
            reconciler.clone(),
            shutdown.child_token(),
        ));

        let result = reconciler.run(signal_rx, shutdown.clone()).await;

        shutdown.cancel();
        while tasks.join_next().await.is_some() {}
        result
    }
}

/// The single-writer control loop converging wireguard and the vault onto
/// the watched cluster state.
pub struct Reconciler {
    node_name: String,
    listen_port: u16,
    node_cidr: String,
    endpoint: String,
    resync_period: Duration,
    store: Arc<dyn ClusterStore>,
    tunnel: Arc<dyn TunnelInterface>,
}

impl Reconciler {
    /// Selects on shutdown, the coalesced watch signal and the periodic
    /// ticker; each wakeup runs a full idempotent resync.
    async fn run(
        &self,
        signal: flume::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(self.resync_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("reconcile loop shutting down");
                    return Ok(());
                }
                event = signal.recv_async() => match event {
                    Ok(()) => self.resync().await?,
                    Err(_) => return Err(Error::System("watch signal channel closed".into())),
                },
                _ = ticker.tick() => self.resync().await?,
            }
        }
    }

    /// Full-state resync: converge the kernel first, then fill vault gaps.
    /// New vault entries retrigger a resync on both ends through the vault
    /// watcher.
    async fn resync(&self) -> Result<(), Error> {
        match with_backoff(|| self.sync_with_wireguard()).await {
            Ok(()) => {}
            // kernel-side failures heal on the next tick; only cluster-store
            // failures escalate to a restart
            Err(e @ Error::System(_)) => {
                warn!(error = %e, "peer sync failed, retrying on next tick")
            }
            Err(e) => return Err(e),
        }

        with_backoff(|| self.update_peer_secrets(false)).await?;
        debug!("resync complete");
        Ok(())
    }

    /// Computes the desired peer set from the node records and the vault and
    /// hands it to the tunnel manager.
    async fn sync_with_wireguard(&self) -> Result<(), Error> {
        let records = self.store.list_node_records().await?;
        let vault = self.store.read_vault().await?;

        let mut desired = HashMap::with_capacity(records.len());
        for record in &records {
            let name = record.name_any();
            // we don't connect to ourselves
            if name == self.node_name {
                continue;
            }
            let Some(status) = record.status.as_ref() else {
                debug!(node = %name, "node record has no status yet");
                continue;
            };
            let Some(secret) = vault.get(&node_pair_key(&self.node_name, &name)) else {
                // update_peer_secrets mints the missing key right after this
                // pass, which retriggers a resync
                debug!(node = %name, "no shared secret with peer yet");
                continue;
            };

            desired.insert(
                status.public_key.clone(),
                Peer {
                    public_key: status.public_key.clone(),
                    shared_key: String::from_utf8_lossy(secret).into_owned(),
                    allowed_ips: vec![status.node_cidr.clone()],
                    endpoint: format!("{}:{}", status.endpoint, status.port),
                },
            );
        }

        self.tunnel.sync_peers(desired).await
    }

    /// Writes pair secrets for this node. With `overwrite` every pair
    /// involving self is rotated (the restart policy); without it only
    /// missing entries are minted and existing ones are never touched.
    async fn update_peer_secrets(&self, overwrite: bool) -> Result<(), Error> {
        let records = self.store.list_node_records().await?;
        let mut vault = self.store.read_vault().await?;

        let mut changed = false;
        for record in &records {
            let name = record.name_any();
            if name == self.node_name {
                continue;
            }
            let key = node_pair_key(&self.node_name, &name);
            if overwrite || !vault.contains_key(&key) {
                vault.insert(key, self.tunnel.generate_shared_key().into_bytes());
                changed = true;
            }
        }

        if changed {
            // last writer wins; a clobbered write is regenerated when the
            // losing side reconciles again
            self.store.write_vault(vault).await?;
        }
        Ok(())
    }

    /// Publishes this node's record. Safe to call repeatedly; the store
    /// upserts and the newest public key wins.
    pub async fn publish_node_record(&self) -> Result<(), Error> {
        let record = Wgnode::named(
            &self.node_name,
            WgnodeStatus {
                port: self.listen_port,
                public_key: self.tunnel.public_key(),
                node_cidr: self.node_cidr.clone(),
                endpoint: self.endpoint.clone(),
            },
        );
        debug!(node = %self.node_name, "publishing node record");
        self.store.publish_node_record(&record).await
    }

    /// Garbage-collects records whose backing cluster node is gone. A record
    /// whose cluster node still exists is never deleted.
    async fn check_node_deletion(&self) -> Result<(), Error> {
        let records = self.store.list_node_records().await?;
        for record in &records {
            let name = record.name_any();
            if self.store.cluster_node(&name).await?.is_none() {
                info!(node = %name, "removing record for deleted cluster node");
                self.store.delete_node_record(&name).await?;
            }
        }
        Ok(())
    }

    /// Deletion-scan task, spread out with a randomized per-node interval so
    /// agents don't stampede the API server.
    async fn gc_runner(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let count = match self.store.list_node_records().await {
                Ok(records) => records.len().max(1),
                Err(e) => {
                    debug!(error = %e, "unable to count node records");
                    1
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(calculate_next_node_sleep_interval(count)) => {
                    if let Err(e) = self.check_node_deletion().await {
                        warn!(error = %e, "error checking for deleted nodes");
                    }
                }
            }
        }
    }
}

/// The vault key for an unordered pair of node names. Symmetric, so both
/// ends address the same slot.
pub fn node_pair_key(a: &str, b: &str) -> String {
    if a < b {
        format!("shared-secret-{a}-{b}")
    } else {
        format!("shared-secret-{b}-{a}")
    }
}

/// `count * 60s`, scaled by a random factor in [0.25, 1.75].
fn calculate_next_node_sleep_interval(count: usize) -> Duration {
    let base = NODE_SLEEP_INTERVAL.as_secs_f64() * count as f64;
    let factor = 0.25 + rand::thread_rng().r#gen::<f64>() * 1.5;
    Duration::from_secs_f64(base * factor)
}

/// Retries transient failures: 500 ms doubling to a 5 s cap, giving up once
/// the next sleep would push past 10 s of waiting.
async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut delay = BACKOFF_INITIAL;
    let mut waited = Duration::ZERO;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                if waited + delay > BACKOFF_TOTAL {
                    return Err(e);
                }
                debug!(error = %e, ?delay, "retrying");
                sleep(delay).await;
                waited += delay;
                delay = (delay * 2).min(BACKOFF_CAP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::memory::MemoryStore;
    use crate::kube::{ClusterNodeInfo, Vault};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockTunnel {
        public_key: String,
        shared_key: StdMutex<String>,
        peers: StdMutex<HashMap<String, Peer>>,
    }

    impl MockTunnel {
        fn with_public_key(public_key: &str) -> Self {
            Self {
                public_key: public_key.to_string(),
                ..Default::default()
            }
        }

        fn set_shared_key(&self, key: &str) {
            *self.shared_key.lock().unwrap() = key.to_string();
        }

        fn peers(&self) -> HashMap<String, Peer> {
            self.peers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TunnelInterface for MockTunnel {
        fn public_key(&self) -> String {
            self.public_key.clone()
        }

        fn generate_shared_key(&self) -> String {
            self.shared_key.lock().unwrap().clone()
        }

        async fn sync_peers(&self, desired: HashMap<String, Peer>) -> Result<(), Error> {
            *self.peers.lock().unwrap() = desired;
            Ok(())
        }
    }

    fn reconciler(node_name: &str) -> (Arc<MemoryStore>, Arc<MockTunnel>, Reconciler) {
        let store = Arc::new(MemoryStore::new());
        let tunnel = Arc::new(MockTunnel::with_public_key("public-1"));
        let reconciler = Reconciler {
            node_name: node_name.to_string(),
            listen_port: 1000,
            node_cidr: "10.240.0.0/24".to_string(),
            endpoint: "10.0.0.100".to_string(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            store: store.clone(),
            tunnel: tunnel.clone(),
        };
        (store, tunnel, reconciler)
    }

    fn record(name: &str, port: u16, node_cidr: &str, endpoint: &str) -> Wgnode {
        Wgnode::named(
            name,
            WgnodeStatus {
                port,
                public_key: name.to_string(),
                node_cidr: node_cidr.to_string(),
                endpoint: endpoint.to_string(),
            },
        )
    }

    #[test]
    fn test_node_pair_key_symmetric() {
        assert_eq!(
            node_pair_key("nodeA", "nodeB"),
            "shared-secret-nodeA-nodeB"
        );
        assert_eq!(
            node_pair_key("nodeB", "nodeA"),
            "shared-secret-nodeA-nodeB"
        );
    }

    #[tokio::test]
    async fn test_publish_node_record_idempotent() {
        let (store, _tunnel, reconciler) = reconciler("node-1");

        reconciler.publish_node_record().await.unwrap();
        reconciler.publish_node_record().await.unwrap();
        reconciler.publish_node_record().await.unwrap();

        assert_eq!(store.record_count(), 1);
        let status = store.record("node-1").unwrap().status.unwrap();
        assert_eq!(status.port, 1000);
        assert_eq!(status.public_key, "public-1");
        assert_eq!(status.node_cidr, "10.240.0.0/24");
        assert_eq!(status.endpoint, "10.0.0.100");
    }

    #[tokio::test]
    async fn test_integrate_peers() {
        let (store, tunnel, reconciler) = reconciler("test-node");
        store.init_vault().await.unwrap();

        // first peer appears
        store.insert_record(record("pub1", 1000, "10.240.1.0/24", "10.0.0.1"));
        tunnel.set_shared_key("shared1");
        reconciler.update_peer_secrets(false).await.unwrap();
        reconciler.sync_with_wireguard().await.unwrap();

        let expected_pub1 = Peer {
            public_key: "pub1".into(),
            shared_key: "shared1".into(),
            allowed_ips: vec!["10.240.1.0/24".into()],
            endpoint: "10.0.0.1:1000".into(),
        };
        assert_eq!(
            tunnel.peers(),
            HashMap::from([("pub1".to_string(), expected_pub1.clone())])
        );

        // second peer appears; the first keeps its secret
        store.insert_record(record("pub2", 1000, "10.240.2.0/24", "10.0.0.2"));
        tunnel.set_shared_key("shared2");
        reconciler.update_peer_secrets(false).await.unwrap();
        reconciler.sync_with_wireguard().await.unwrap();

        let expected_pub2 = Peer {
            public_key: "pub2".into(),
            shared_key: "shared2".into(),
            allowed_ips: vec!["10.240.2.0/24".into()],
            endpoint: "10.0.0.2:1000".into(),
        };
        assert_eq!(
            tunnel.peers(),
            HashMap::from([
                ("pub1".to_string(), expected_pub1.clone()),
                ("pub2".to_string(), expected_pub2),
            ])
        );

        // second peer leaves
        store.remove_record("pub2");
        reconciler.sync_with_wireguard().await.unwrap();
        assert_eq!(
            tunnel.peers(),
            HashMap::from([("pub1".to_string(), expected_pub1)])
        );
    }

    #[tokio::test]
    async fn test_sync_skips_peer_without_secret() {
        let (store, tunnel, reconciler) = reconciler("test-node");
        store.init_vault().await.unwrap();
        store.insert_record(record("pub1", 1000, "10.240.1.0/24", "10.0.0.1"));

        reconciler.sync_with_wireguard().await.unwrap();
        assert!(tunnel.peers().is_empty());

        tunnel.set_shared_key("shared1");
        reconciler.update_peer_secrets(false).await.unwrap();
        reconciler.sync_with_wireguard().await.unwrap();
        assert_eq!(tunnel.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_update_peer_secrets_overwrite() {
        let (store, tunnel, reconciler) = reconciler("test0");
        store.set_vault(Vault::from([(
            "shared-secret-test0-test1".to_string(),
            b"old".to_vec(),
        )]));
        store.insert_record(record("test0", 1000, "10.240.0.0/24", "10.0.0.100"));
        store.insert_record(record("test1", 1000, "10.240.1.0/24", "10.0.0.1"));

        // rotation on restart rewrites the existing entry
        tunnel.set_shared_key("new");
        reconciler.update_peer_secrets(true).await.unwrap();
        let vault = store.vault();
        assert_eq!(vault["shared-secret-test0-test1"], b"new".to_vec());
        // no pair with ourselves
        assert!(!vault.contains_key("shared-secret-test0-test0"));

        // a later non-overwriting pass never mutates an existing entry
        tunnel.set_shared_key("newer");
        reconciler.update_peer_secrets(false).await.unwrap();
        assert_eq!(store.vault()["shared-secret-test0-test1"], b"new".to_vec());
    }

    #[tokio::test]
    async fn test_update_peer_secrets_fills_missing() {
        let (store, tunnel, reconciler) = reconciler("test0");
        store.set_vault(Vault::from([(
            "shared-secret-test0-test1".to_string(),
            b"secret2".to_vec(),
        )]));
        for name in ["test1", "test6"] {
            store.insert_record(record(name, 1000, "10.240.1.0/24", "10.0.0.1"));
        }

        tunnel.set_shared_key("secret3");
        reconciler.update_peer_secrets(false).await.unwrap();

        let vault = store.vault();
        assert_eq!(vault["shared-secret-test0-test1"], b"secret2".to_vec());
        assert_eq!(vault["shared-secret-test0-test6"], b"secret3".to_vec());
    }

    #[tokio::test]
    async fn test_check_node_deletion() {
        let (store, _tunnel, reconciler) = reconciler("node2");
        for name in ["node1", "node2", "node3"] {
            store.insert_record(record(name, 1000, "10.240.1.0/24", "10.0.0.1"));
        }
        store.insert_cluster_node("node2", ClusterNodeInfo::default());

        reconciler.check_node_deletion().await.unwrap();
        assert_eq!(store.record_names(), vec!["node2".to_string()]);
    }

    #[test]
    fn test_calculate_node_sleep_interval_bounds() {
        for count in 1..=10usize {
            let min = NODE_SLEEP_INTERVAL.as_secs_f64() * count as f64 * 0.25;
            let max = NODE_SLEEP_INTERVAL.as_secs_f64() * count as f64 * 1.75;
            for _ in 0..200 {
                let interval = calculate_next_node_sleep_interval(count).as_secs_f64();
                assert!(interval >= min, "{interval} < {min} for count {count}");
                assert!(interval <= max, "{interval} > {max} for count {count}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_gives_up() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), Error> = with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::System("boom".into())) }
        })
        .await;

        assert!(result.is_err());
        // delays 500ms, 1s, 2s, 4s fit the 10s budget; the 5s cap would not
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_recovers() {
        let attempts = AtomicUsize::new(0);
        let result = with_backoff(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::System("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn test_with_backoff_propagates_cancel() {
        let result: Result<(), Error> = with_backoff(|| async { Err(Error::Canceled) }).await;
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
