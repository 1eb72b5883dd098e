use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a Wgnode. All interesting data lives in the status; the
/// spec exists because the resource does.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "wormhole.gravitational.io",
    version = "v1beta1",
    kind = "Wgnode",
    namespaced,
    status = "WgnodeStatus",
    derive = "Default"
)]
pub struct WgnodeSpec {}

/// A node's advertisement of its tunnel endpoint, published by the owning
/// agent on every start and consumed by every other agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct WgnodeStatus {
    /// UDP port wireguard listens on.
    pub port: u16,
    /// Base64 encoded wireguard public key, regenerated on every process
    /// start.
    pub public_key: String,
    /// IPv4 range in CIDR format assigned to this node.
    pub node_cidr: String,
    /// IPv4 address the other nodes connect to.
    pub endpoint: String,
}

impl Wgnode {
    pub fn named(name: &str, status: WgnodeStatus) -> Self {
        let mut node = Wgnode::new(name, WgnodeSpec::default());
        node.status = Some(status);
        node
    }
}
