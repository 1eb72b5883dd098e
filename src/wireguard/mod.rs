mod cli;

pub use cli::WgCli;

use crate::error::Error;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ipnet::Ipv4Net;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Seconds between keepalive probes sent to every peer, so that tunnels
/// survive stateful middleboxes between the nodes.
pub const PERSISTENT_KEEPALIVE: u16 = 15;

/// Configuration for building the local wireguard interface.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Name of the wireguard interface to create.
    pub interface_name: String,
    /// Address in CIDR notation to assign to the interface.
    pub ip: String,
    /// UDP port wireguard listens on for tunnel traffic.
    pub listen_port: u16,
    /// Networks routed towards the interface.
    pub overlay_networks: Vec<Ipv4Net>,
}

impl Config {
    pub fn check(&self) -> Result<(), Error> {
        if self.interface_name.is_empty() {
            return Err(Error::BadParameter("interface name is not set".into()));
        }
        if self.listen_port == 0 {
            return Err(Error::BadParameter("listen port is not set".into()));
        }
        match self.ip.parse::<Ipv4Net>() {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::BadParameter(format!(
                "interface address must be an ipv4 CIDR, got {:?}: {e}",
                self.ip
            ))),
        }
    }
}

/// A wireguard peer as configured on the local interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peer {
    pub public_key: String,
    pub shared_key: String,
    pub allowed_ips: Vec<String>,
    pub endpoint: String,
}

impl Peer {
    /// Field-wise comparison with allowed-IP lists sorted, since the kernel
    /// does not preserve the order they were written in.
    pub fn matches(&self, other: &Peer) -> bool {
        if self.public_key != other.public_key
            || self.shared_key != other.shared_key
            || self.endpoint != other.endpoint
            || self.allowed_ips.len() != other.allowed_ips.len()
        {
            return false;
        }
        let mut ours = self.allowed_ips.clone();
        let mut theirs = other.allowed_ips.clone();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }
}

/// A peer as read back from the kernel via `wg show <iface> dump`.
///
/// The shared key cannot be read back and is filled in from the in-process
/// cache. The handshake and traffic counters are retained for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatus {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub last_handshake: Option<u64>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub keepalive: Option<u16>,
}

impl PeerStatus {
    fn to_peer(&self, shared_key: String) -> Peer {
        Peer {
            public_key: self.public_key.clone(),
            shared_key,
            endpoint: self.endpoint.clone(),
            allowed_ips: if self.allowed_ips.is_empty() {
                Vec::new()
            } else {
                self.allowed_ips.split(',').map(str::to_string).collect()
            },
        }
    }
}

/// The raw operations the tunnel manager needs from the host.
///
/// The production implementation shells out to `wg(8)` and `ip(8)`; tests
/// substitute a mock so peer-set convergence can be verified without a
/// kernel.
#[async_trait]
pub trait WgCommands: Send + Sync {
    async fn gen_key(&self) -> Result<String, Error>;
    async fn pub_key(&self, private_key: &str) -> Result<String, Error>;
    async fn create_interface(&self) -> Result<(), Error>;
    async fn delete_interface(&self) -> Result<(), Error>;
    async fn set_ip(&self, ip: &str) -> Result<(), Error>;
    async fn set_private_key(&self, key: &str) -> Result<(), Error>;
    async fn set_listen_port(&self, port: u16) -> Result<(), Error>;
    async fn set_up(&self) -> Result<(), Error>;
    async fn add_route(&self, route: &str) -> Result<(), Error>;
    async fn add_peer(&self, peer: &Peer) -> Result<(), Error>;
    async fn remove_peer(&self, public_key: &str) -> Result<(), Error>;
    async fn list_peers(&self) -> Result<HashMap<String, PeerStatus>, Error>;
}

/// The subset of tunnel operations the reconciler depends on.
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    fn public_key(&self) -> String;
    fn generate_shared_key(&self) -> String;
    async fn sync_peers(&self, desired: HashMap<String, Peer>) -> Result<(), Error>;
}

/// Owner of the local wireguard device.
///
/// Created once at startup; the keypair is regenerated on every process
/// start and the private key never leaves the kernel plus the temporary file
/// used to hand it to `wg(8)`.
pub struct Tunnel {
    wg: Arc<dyn WgCommands>,
    public_key: String,
    // wg(8) loads keys through temporary files, so concurrent invocations
    // are racy. The same lock guards the shared-key cache, which must stay
    // consistent with what was actually written to the kernel.
    shared_keys: Mutex<HashMap<String, String>>,
}

impl Tunnel {
    /// Builds the wireguard interface from scratch.
    ///
    /// Any pre-existing interface of the same name is destroyed first, so a
    /// restarted agent always starts from a clean device with fresh keys.
    pub async fn new(config: Config, wg: Arc<dyn WgCommands>) -> Result<Self, Error> {
        config.check()?;

        if let Err(e) = wg.delete_interface().await {
            debug!(error = %e, "no previous interface to remove");
        }

        let private_key = wg.gen_key().await?;
        let public_key = wg.pub_key(&private_key).await?;

        wg.create_interface().await?;
        wg.set_ip(&config.ip).await?;
        wg.set_private_key(&private_key).await?;
        wg.set_listen_port(config.listen_port).await?;
        wg.set_up().await?;

        for network in &config.overlay_networks {
            wg.add_route(&network.to_string()).await?;
        }

        info!(interface = %config.interface_name, port = config.listen_port, "wireguard interface ready");

        Ok(Self {
            wg,
            public_key,
            shared_keys: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TunnelInterface for Tunnel {
    fn public_key(&self) -> String {
        self.public_key.clone()
    }

    fn generate_shared_key(&self) -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Converges the kernel peer set onto `desired`.
    ///
    /// Peers whose allowed-IPs, endpoint or shared key differ are removed and
    /// re-added; the kernel has no single atomic update that covers shared
    /// key rotation. Every operation is attempted even after a failure and
    /// the first error is returned, so the reconcile loop retries on the next
    /// tick without losing the remaining peers.
    async fn sync_peers(&self, desired: HashMap<String, Peer>) -> Result<(), Error> {
        let mut cache = self.shared_keys.lock().await;
        let live = self.wg.list_peers().await?;

        let mut first_err: Option<Error> = None;
        let mut record = |result: Result<(), Error>, public_key: &str, op: &str| {
            if let Err(e) = result {
                warn!(peer = public_key, op, error = %e, "peer operation failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        for (public_key, status) in &live {
            let shared_key = cache.get(public_key).cloned().unwrap_or_default();
            let live_peer = status.to_peer(shared_key);

            match desired.get(public_key) {
                Some(want) if want.matches(&live_peer) => {}
                Some(want) => {
                    debug!(peer = public_key, "re-creating out-of-date peer");
                    record(self.wg.remove_peer(public_key).await, public_key, "remove");
                    match self.wg.add_peer(want).await {
                        Ok(()) => {
                            cache.insert(public_key.clone(), want.shared_key.clone());
                        }
                        Err(e) => record(Err(e), public_key, "add"),
                    }
                }
                None => {
                    debug!(peer = public_key, "removing peer that is not in desired state");
                    match self.wg.remove_peer(public_key).await {
                        Ok(()) => {
                            cache.remove(public_key);
                        }
                        Err(e) => record(Err(e), public_key, "remove"),
                    }
                }
            }
        }

        for (public_key, want) in &desired {
            if !live.contains_key(public_key) {
                debug!(peer = public_key, "adding missing peer");
                match self.wg.add_peer(want).await {
                    Ok(()) => {
                        cache.insert(public_key.clone(), want.shared_key.clone());
                    }
                    Err(e) => record(Err(e), public_key, "add"),
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
