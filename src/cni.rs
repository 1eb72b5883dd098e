use crate::error::Error;
use crate::ipam::IpamInfo;
use serde_json::{Value, json};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFLIST_PATH: &str = "/etc/cni/net.d/wormhole.conflist";
const HOST_CNI_BIN: &str = "/host/opt/cni/bin";
const BUNDLED_CNI_BIN: &str = "/opt/cni/bin";

/// Renders the CNI configuration chain handed to the kubelet: a bridge
/// plugin with host-local IPAM over the node's pod range, followed by
/// portmap for hostPort support.
pub fn render(bridge_iface: &str, bridge_mtu: u16, node_cidr: &str, ipam: &IpamInfo) -> Value {
    json!({
        "cniVersion": "0.3.1",
        "name": "wormhole",
        "plugins": [
            {
                "type": "bridge",
                "bridge": bridge_iface,
                "isGateway": true,
                "isDefaultGateway": true,
                "forceAddress": false,
                "ipMasq": false,
                "hairpinMode": true,
                "mtu": bridge_mtu,
                "ipam": {
                    "type": "host-local",
                    "ranges": [[{
                        "subnet": node_cidr,
                        "rangeStart": ipam.pod_addr_start.to_string(),
                        "rangeEnd": ipam.pod_addr_end.to_string(),
                    }]],
                },
            },
            {
                "type": "portmap",
                "capabilities": { "portMappings": true },
            },
        ],
    })
}

/// The conflist lands on the host filesystem, which is mounted under /host
/// when the agent runs inside a pod.
pub fn conflist_path(running_in_pod: bool) -> PathBuf {
    if running_in_pod {
        Path::new("/host").join(CONFLIST_PATH.trim_start_matches('/'))
    } else {
        PathBuf::from(CONFLIST_PATH)
    }
}

/// Writes the rendered configuration with root ownership and mode 0644.
pub fn write_config(
    bridge_iface: &str,
    bridge_mtu: u16,
    node_cidr: &str,
    ipam: &IpamInfo,
    running_in_pod: bool,
) -> Result<(), Error> {
    let config = render(bridge_iface, bridge_mtu, node_cidr, ipam);
    let payload = serde_json::to_string_pretty(&config)
        .map_err(|e| Error::System(format!("failed to encode CNI configuration: {e}")))?;

    let path = conflist_path(running_in_pod);
    let dir = path
        .parent()
        .ok_or_else(|| Error::BadParameter(format!("invalid CNI path {}", path.display())))?;

    fs::create_dir_all(dir)?;
    fs::write(&path, payload.as_bytes())?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

    // the kubelet refuses configuration not owned by root
    std::os::unix::fs::chown(dir, Some(0), Some(0))?;
    std::os::unix::fs::chown(&path, Some(0), Some(0))?;

    info!(path = %path.display(), "generated CNI configuration");
    debug!(config = %payload, "CNI configuration payload");
    Ok(())
}

/// Copies the bundled CNI plugin binaries onto the host, when a host bin
/// directory is mounted.
pub fn sync_cni_bin() -> Result<(), Error> {
    if !Path::new(HOST_CNI_BIN).exists() {
        return Ok(());
    }

    for entry in fs::read_dir(BUNDLED_CNI_BIN)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let target = Path::new(HOST_CNI_BIN).join(entry.file_name());
        fs::copy(entry.path(), &target)?;
        debug!(target = %target.display(), "installed CNI plugin binary");
    }
    Ok(())
}
