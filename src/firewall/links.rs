use crate::error::Error;
use std::process::Command;

/// A network link as reported by `ip -o link show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub mtu: u32,
}

/// Enumerates the host's network links with their MTUs.
pub fn list_links() -> Result<Vec<Link>, Error> {
    let output = Command::new("ip")
        .args(["-o", "link", "show"])
        .output()
        .map_err(|e| Error::System(format!("failed to spawn ip link show: {e}")))?;

    if !output.status.success() {
        return Err(Error::System(format!(
            "ip link show failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(parse_link_lines(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses the one-line-per-link output of `ip -o link show`.
///
/// Lines look like `2: eth0: <BROADCAST,...> mtu 1500 qdisc ...`; veth ends
/// carry an `@ifN` suffix on the name that is not part of the link name.
pub(crate) fn parse_link_lines(output: &str) -> Vec<Link> {
    let mut links = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }

        let name = fields[1].trim_end_matches(':');
        let name = name.split('@').next().unwrap_or(name);
        if name.is_empty() {
            continue;
        }

        let mtu = fields
            .iter()
            .position(|f| *f == "mtu")
            .and_then(|i| fields.get(i + 1))
            .and_then(|m| m.parse::<u32>().ok());

        if let Some(mtu) = mtu {
            links.push(Link {
                name: name.to_string(),
                mtu,
            });
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_lines() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\\    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
5: veth2a1b@if4: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue master wormhole-br0 state UP mode DEFAULT group default\\    link/ether aa:bb:cc:dd:ee:ff brd ff:ff:ff:ff:ff:ff
";

        let links = parse_link_lines(output);
        assert_eq!(
            links,
            vec![
                Link {
                    name: "lo".into(),
                    mtu: 65536
                },
                Link {
                    name: "eth0".into(),
                    mtu: 1500
                },
                Link {
                    name: "veth2a1b".into(),
                    mtu: 1450
                },
            ]
        );
    }

    #[test]
    fn test_parse_link_lines_skips_garbage() {
        assert!(parse_link_lines("not a link line\n\n").is_empty());
    }
}
