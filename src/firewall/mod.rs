mod links;

pub use links::Link;

use crate::error::Error;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const ANTISPOOFING_CHAIN: &str = "WORMHOLE-ANTISPOOFING";
pub const MSS_CHAIN: &str = "WORMHOLE-MSS";

const NAT: &str = "nat";
const FILTER: &str = "filter";
const MANGLE: &str = "mangle";
const POSTROUTING: &str = "POSTROUTING";
const FORWARD: &str = "FORWARD";
const INPUT: &str = "INPUT";

/// Chains owned by wormhole, removed and recreated wholesale.
const OWNED_CHAINS: [(&str, &str); 2] = [(FILTER, ANTISPOOFING_CHAIN), (MANGLE, MSS_CHAIN)];

#[derive(Debug, Clone)]
pub struct Config {
    /// The overlay network range.
    pub overlay_cidr: String,
    /// The local pod network range.
    pub pod_cidr: String,
    /// Interface name of the wireguard tunnel.
    pub wireguard_iface: String,
    /// Interface name of the linux bridge.
    pub bridge_iface: String,
    /// How often to verify the rules are still in place.
    pub sync_interval: Duration,
}

/// One iptables rule together with the comment identifying it as ours, so
/// rules orphaned by earlier process generations can be found and removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: String,
    pub spec: String,
    pub comment: &'static str,
}

impl Rule {
    fn new(table: &'static str, chain: &str, spec: String, comment: &'static str) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            spec,
            comment,
        }
    }

    /// The full rule specification handed to iptables.
    pub fn rule_spec(&self) -> String {
        format!("{} -m comment --comment \"{}\"", self.spec, self.comment)
    }
}

/// The iptables and link operations the firewall needs from the host, kept
/// behind a trait so the heal loop can be exercised without root.
pub trait FirewallDriver: Send + Sync {
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error>;
    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn has_random_fully(&self) -> bool;
    fn links(&self) -> Result<Vec<Link>, Error>;
}

/// Production driver backed by the `iptables` crate and `ip(8)`.
pub struct SystemDriver {
    ipt: iptables::IPTables,
    random_fully: bool,
}

impl SystemDriver {
    pub fn new() -> Result<Self, Error> {
        let ipt = iptables::new(false).map_err(|e| Error::System(e.to_string()))?;
        let random_fully = Command::new("iptables")
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| supports_random_fully(&String::from_utf8_lossy(&o.stdout)))
            .unwrap_or(false);
        Ok(Self { ipt, random_fully })
    }
}

impl FirewallDriver for SystemDriver {
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.ipt
            .new_chain(table, chain)
            .map_err(|e| Error::System(e.to_string()))
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.ipt
            .flush_chain(table, chain)
            .map_err(|e| Error::System(e.to_string()))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.ipt
            .delete_chain(table, chain)
            .map_err(|e| Error::System(e.to_string()))
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        self.ipt
            .exists(table, chain, rule)
            .map_err(|e| Error::System(e.to_string()))
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.ipt
            .append_unique(table, chain, rule)
            .map_err(|e| Error::System(e.to_string()))
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.ipt
            .delete(table, chain, rule)
            .map_err(|e| Error::System(e.to_string()))
    }

    fn has_random_fully(&self) -> bool {
        self.random_fully
    }

    fn links(&self) -> Result<Vec<Link>, Error> {
        links::list_links()
    }
}

/// `--random-fully` landed in iptables 1.6.2.
fn supports_random_fully(version_output: &str) -> bool {
    let version = version_output
        .split_whitespace()
        .find_map(|word| word.strip_prefix('v'))
        .unwrap_or("");

    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let (major, minor, patch) = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );

    (major, minor, patch) >= (1, 6, 2)
}

/// Owner of the wormhole iptables bundle.
///
/// Bootstraps the chains once (fatal on failure), then periodically verifies
/// every rule and rebuilds the whole bundle if any is missing. Missing rules
/// are expected, e.g. after an external `iptables -F`, and are healed
/// silently.
pub struct Firewall {
    config: Config,
    driver: Arc<dyn FirewallDriver>,
}

impl Firewall {
    pub fn new(config: Config, driver: Arc<dyn FirewallDriver>) -> Self {
        Self { config, driver }
    }

    /// Removes any leftover state from a previous process generation and
    /// builds the rules from scratch.
    pub fn bootstrap(&self) -> Result<(), Error> {
        self.cleanup_rules();
        self.create_rules()
    }

    /// The periodic re-assertion task. Cleans the chains up on shutdown; the
    /// data plane keeps flowing through the tunnel either way.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately and the rules were just created
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    trace!("firewall task cancelled");
                    self.cleanup_rules();
                    break;
                }
                _ = interval.tick() => {
                    match self.rules_ok() {
                        Ok(()) => debug!("iptables re-sync complete"),
                        Err(e) if e.is_not_found() => {
                            info!("iptables rules missing, rebuilding");
                            self.cleanup_rules();
                            if let Err(e) = self.create_rules() {
                                warn!(error = %e, "error recreating iptables rules");
                            }
                        }
                        Err(e) => warn!(error = %e, "error checking iptables rules"),
                    }
                }
            }
        }
    }

    /// The full rule bundle for the given set of host links.
    fn generate_rules(&self, links: &[Link]) -> Vec<Rule> {
        let overlay = &self.config.overlay_cidr;
        let pod = &self.config.pod_cidr;
        let masquerade = if self.driver.has_random_fully() {
            "-j MASQUERADE --random-fully"
        } else {
            "-j MASQUERADE"
        };

        let mut rules = vec![
            // overlay-internal traffic keeps its addresses
            Rule::new(
                NAT,
                POSTROUTING,
                format!("-s {overlay} -d {overlay} -j RETURN"),
                "wormhole: overlay->overlay",
            ),
            Rule::new(
                NAT,
                POSTROUTING,
                format!("-s {pod} {masquerade}"),
                "wormhole: nat overlay->internet",
            ),
            // preserves source IPs on ingress to local pods
            // (externalTrafficPolicy=Local)
            Rule::new(
                NAT,
                POSTROUTING,
                format!("-d {pod} -j RETURN"),
                "wormhole: preserve source-ip",
            ),
            Rule::new(
                NAT,
                POSTROUTING,
                format!("-d {overlay} {masquerade}"),
                "wormhole: nat internet->overlay",
            ),
        ];

        // overlay-range sources are only legitimate on the bridge, the
        // tunnel, or loopback; wireguard enforces the per-peer source range
        // on the tunnel side
        rules.extend([
            Rule::new(
                FILTER,
                ANTISPOOFING_CHAIN,
                format!("-i {} -s {pod} -j RETURN", self.config.bridge_iface),
                "wormhole: antispoofing",
            ),
            Rule::new(
                FILTER,
                ANTISPOOFING_CHAIN,
                format!("-i {} -s {overlay} -j RETURN", self.config.wireguard_iface),
                "wormhole: antispoofing",
            ),
            Rule::new(
                FILTER,
                ANTISPOOFING_CHAIN,
                "-i lo -j RETURN".to_string(),
                "wormhole: antispoofing",
            ),
            Rule::new(
                FILTER,
                ANTISPOOFING_CHAIN,
                "-j DROP".to_string(),
                "wormhole: drop spoofed traffic",
            ),
            Rule::new(
                FILTER,
                FORWARD,
                format!("-s {overlay} -j {ANTISPOOFING_CHAIN}"),
                "wormhole: check antispoofing",
            ),
            Rule::new(
                FILTER,
                INPUT,
                format!("-s {overlay} -j {ANTISPOOFING_CHAIN}"),
                "wormhole: check antispoofing",
            ),
        ]);

        // clamp TCP MSS towards every external link, 40 bytes below the link
        // MTU for the IPv4 and TCP headers
        for link in links {
            if link.name.starts_with("wormhole")
                || link.name.starts_with("veth")
                || link.name.starts_with("lo")
            {
                continue;
            }
            rules.push(Rule::new(
                MANGLE,
                MSS_CHAIN,
                format!(
                    "-o {} -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --set-mss {}",
                    link.name,
                    link.mtu.saturating_sub(40)
                ),
                "wormhole: mss clamping",
            ));
        }

        rules.push(Rule::new(
            MANGLE,
            FORWARD,
            format!("-j {MSS_CHAIN}"),
            "wormhole: check mss clamping",
        ));

        rules
    }

    /// Checks that every rule of the bundle is present.
    fn rules_ok(&self) -> Result<(), Error> {
        let links = self.driver.links()?;
        for rule in self.generate_rules(&links) {
            if !self.driver.exists(rule.table, &rule.chain, &rule.rule_spec())? {
                return Err(Error::NotFound(format!(
                    "missing rule in {}/{}",
                    rule.table, rule.chain
                )));
            }
        }
        Ok(())
    }

    /// Best-effort removal of every rule and both owned chains. Delete
    /// failures are expected when the rule never existed.
    fn cleanup_rules(&self) {
        for rule in self.generate_rules(&[]) {
            trace!(table = rule.table, chain = %rule.chain, spec = %rule.spec, "deleting iptables rule");
            if let Err(e) = self.driver.delete(rule.table, &rule.chain, &rule.rule_spec()) {
                trace!(error = %e, "delete rule failed");
            }
        }

        for (table, chain) in OWNED_CHAINS {
            if let Err(e) = self.driver.clear_chain(table, chain) {
                trace!(table, chain, error = %e, "clear chain failed");
            }
            if let Err(e) = self.driver.delete_chain(table, chain) {
                trace!(table, chain, error = %e, "delete chain failed");
            }
        }
    }

    /// Recreates both owned chains and appends the full bundle. Chain
    /// creation failure is fatal; the caller gives up on bootstrap.
    fn create_rules(&self) -> Result<(), Error> {
        for (table, chain) in OWNED_CHAINS {
            if let Err(e) = self.driver.clear_chain(table, chain) {
                trace!(table, chain, error = %e, "clear chain failed");
            }
            if let Err(e) = self.driver.delete_chain(table, chain) {
                trace!(table, chain, error = %e, "delete chain failed");
            }
            self.driver.new_chain(table, chain)?;
        }

        let links = self.driver.links()?;
        for rule in self.generate_rules(&links) {
            debug!(table = rule.table, chain = %rule.chain, spec = %rule.spec, "adding iptables rule");
            self.driver
                .append_unique(rule.table, &rule.chain, &rule.rule_spec())?;
        }
        Ok(())
    }
}
