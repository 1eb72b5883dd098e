use crate::error::Error;
use ipnet::{IpNet, Ipv4Net};
use std::net::Ipv4Addr;

/// Addresses derived from the node's assigned CIDR.
///
/// The layout inside the node range is fixed: `.1` for the linux bridge,
/// `.2/32` for the wireguard interface, and `.10`–`.210` handed to the
/// host-local IPAM plugin for pods. A prefix of at most 24 bits guarantees
/// the offsets stay inside the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamInfo {
    pub bridge_addr: Ipv4Addr,
    pub wireguard_addr: Ipv4Net,
    pub pod_addr_start: Ipv4Addr,
    pub pod_addr_end: Ipv4Addr,
}

/// Derives the bridge, wireguard and pod-range addresses from `node_cidr`.
///
/// Deterministic: the same input always yields the same output. Rejects
/// anything that is not an IPv4 network with a prefix of 24 bits or less.
pub fn derive(node_cidr: &str) -> Result<IpamInfo, Error> {
    let network: IpNet = node_cidr
        .parse()
        .map_err(|e| Error::BadParameter(format!("invalid node CIDR {node_cidr}: {e}")))?;

    let network = match network {
        IpNet::V4(v4) => v4,
        IpNet::V6(_) => {
            return Err(Error::BadParameter(format!(
                "{node_cidr} is not an ipv4 subnet"
            )));
        }
    };

    if network.prefix_len() > 24 {
        return Err(Error::BadParameter(format!(
            "node CIDR needs to be at least 24 bits, {node_cidr} is only {} bits",
            network.prefix_len()
        )));
    }

    let base = network.network().octets();
    let at_offset = |offset: u8| Ipv4Addr::new(base[0], base[1], base[2], base[3] + offset);

    Ok(IpamInfo {
        bridge_addr: at_offset(1),
        wireguard_addr: Ipv4Net::new(at_offset(2), 32)
            .map_err(|e| Error::BadParameter(e.to_string()))?,
        pod_addr_start: at_offset(10),
        pod_addr_end: at_offset(210),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_offsets() {
        let info = derive("10.20.0.0/24").unwrap();
        assert_eq!(info.bridge_addr.to_string(), "10.20.0.1");
        assert_eq!(info.wireguard_addr.to_string(), "10.20.0.2/32");
        assert_eq!(info.pod_addr_start.to_string(), "10.20.0.10");
        assert_eq!(info.pod_addr_end.to_string(), "10.20.0.210");
    }

    #[test]
    fn test_derive_normalizes_host_bits() {
        // a non-zero host part still derives from the network address
        let info = derive("10.20.1.7/24").unwrap();
        assert_eq!(info.bridge_addr.to_string(), "10.20.1.1");
        assert_eq!(info.wireguard_addr.to_string(), "10.20.1.2/32");
    }

    #[test]
    fn test_derive_wide_prefix() {
        let info = derive("10.0.0.0/8").unwrap();
        assert_eq!(info.bridge_addr.to_string(), "10.0.0.1");
        assert_eq!(info.pod_addr_end.to_string(), "10.0.0.210");
    }

    #[test]
    fn test_derive_rejects_malformed() {
        assert!(matches!(derive("10.20.0"), Err(Error::BadParameter(_))));
    }

    #[test]
    fn test_derive_rejects_small_subnet() {
        assert!(matches!(
            derive("10.20.0.0/25"),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_derive_rejects_ipv6() {
        assert!(matches!(derive("::1/64"), Err(Error::BadParameter(_))));
    }
}
