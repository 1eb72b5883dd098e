use crate::error::Error;
use crate::wireguard::{PERSISTENT_KEEPALIVE, Peer, PeerStatus, WgCommands};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// `WgCommands` implemented by shelling out to `wg(8)` and `ip(8)`.
///
/// Netlink would avoid the subprocesses, but only the tools cover the whole
/// wireguard surface; keeping them behind the trait keeps the control loop
/// testable.
pub struct WgCli {
    iface: String,
}

impl WgCli {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, Error> {
        trace!(program, ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::System(format!("failed to spawn {program}: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(Error::System(format!(
                "{program} {} failed: {stderr}",
                args.join(" ")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like `run`, but treats the given stderr fragment as success, for
    /// operations that are idempotent at the tool level.
    async fn run_tolerating(
        &self,
        program: &str,
        args: &[&str],
        acceptable: &str,
    ) -> Result<(), Error> {
        match self.run(program, args).await {
            Ok(_) => Ok(()),
            Err(Error::System(msg)) if msg.contains(acceptable) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// wg(8) only accepts keys by file, so the key is written to a temporary
    /// file that is removed as soon as the command returns.
    fn key_file(key: &str) -> Result<NamedTempFile, Error> {
        let mut file = NamedTempFile::new()?;
        file.write_all(key.as_bytes())?;
        Ok(file)
    }
}

#[async_trait]
impl WgCommands for WgCli {
    async fn gen_key(&self) -> Result<String, Error> {
        let key = self.run("wg", &["genkey"]).await?;
        Ok(key.trim().to_string())
    }

    async fn pub_key(&self, private_key: &str) -> Result<String, Error> {
        let mut child = Command::new("wg")
            .arg("pubkey")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::System(format!("failed to spawn wg pubkey: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::System("wg pubkey stdin unavailable".into()))?;
        stdin.write_all(private_key.as_bytes()).await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::System(format!("wg pubkey failed: {e}")))?;
        if !output.status.success() {
            return Err(Error::System(format!(
                "wg pubkey failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn create_interface(&self) -> Result<(), Error> {
        self.run_tolerating(
            "ip",
            &["link", "add", "dev", &self.iface, "type", "wireguard"],
            "File exists",
        )
        .await
    }

    async fn delete_interface(&self) -> Result<(), Error> {
        self.run_tolerating(
            "ip",
            &["link", "delete", "dev", &self.iface],
            "Cannot find device",
        )
        .await
    }

    async fn set_ip(&self, ip: &str) -> Result<(), Error> {
        self.run_tolerating("ip", &["address", "add", "dev", &self.iface, ip], "File exists")
            .await
    }

    async fn set_private_key(&self, key: &str) -> Result<(), Error> {
        let file = Self::key_file(key)?;
        let path = file.path().to_string_lossy().to_string();
        self.run("wg", &["set", &self.iface, "private-key", &path])
            .await?;
        Ok(())
    }

    async fn set_listen_port(&self, port: u16) -> Result<(), Error> {
        let port = port.to_string();
        self.run("wg", &["set", &self.iface, "listen-port", &port])
            .await?;
        Ok(())
    }

    async fn set_up(&self) -> Result<(), Error> {
        self.run_tolerating("ip", &["link", "set", "up", &self.iface], "File exists")
            .await
    }

    async fn add_route(&self, route: &str) -> Result<(), Error> {
        self.run_tolerating(
            "ip",
            &["route", "add", route, "dev", &self.iface],
            "File exists",
        )
        .await
    }

    async fn add_peer(&self, peer: &Peer) -> Result<(), Error> {
        let file = Self::key_file(&peer.shared_key)?;
        let path = file.path().to_string_lossy().to_string();
        let allowed_ips = peer.allowed_ips.join(",");
        let keepalive = PERSISTENT_KEEPALIVE.to_string();
        self.run(
            "wg",
            &[
                "set",
                &self.iface,
                "peer",
                &peer.public_key,
                "allowed-ips",
                &allowed_ips,
                "endpoint",
                &peer.endpoint,
                "preshared-key",
                &path,
                "persistent-keepalive",
                &keepalive,
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), Error> {
        self.run("wg", &["set", &self.iface, "peer", public_key, "remove"])
            .await?;
        Ok(())
    }

    async fn list_peers(&self) -> Result<HashMap<String, PeerStatus>, Error> {
        let dump = self.run("wg", &["show", &self.iface, "dump"]).await?;
        parse_peer_dump(&dump)
    }
}

/// Parses `wg show <iface> dump` output.
///
/// The first line describes the interface itself; every following line is a
/// peer with eight tab-separated columns: public key, preshared key,
/// endpoint, allowed-ips, latest handshake, rx bytes, tx bytes, keepalive.
fn parse_peer_dump(dump: &str) -> Result<HashMap<String, PeerStatus>, Error> {
    let mut peers = HashMap::new();

    for line in dump.lines().skip(1) {
        if line.is_empty() {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 8 {
            return Err(Error::BadParameter(format!(
                "expected 8 columns in wg show dump, got {}: {line:?}",
                columns.len()
            )));
        }

        let last_handshake = match columns[4] {
            "" | "0" => None,
            secs => Some(secs.parse::<u64>().map_err(|e| {
                Error::BadParameter(format!("invalid handshake time {:?}: {e}", columns[4]))
            })?),
        };

        let bytes_rx = columns[5]
            .parse::<u64>()
            .map_err(|e| Error::BadParameter(format!("invalid rx bytes {:?}: {e}", columns[5])))?;
        let bytes_tx = columns[6]
            .parse::<u64>()
            .map_err(|e| Error::BadParameter(format!("invalid tx bytes {:?}: {e}", columns[6])))?;

        let keepalive = match columns[7] {
            "off" => None,
            secs => Some(secs.parse::<u16>().map_err(|e| {
                Error::BadParameter(format!("invalid keepalive {:?}: {e}", columns[7]))
            })?),
        };

        peers.insert(
            columns[0].to_string(),
            PeerStatus {
                public_key: columns[0].to_string(),
                endpoint: replace_none(columns[2]),
                allowed_ips: replace_none(columns[3]),
                last_handshake,
                bytes_rx,
                bytes_tx,
                keepalive,
            },
        );
    }

    Ok(peers)
}

fn replace_none(s: &str) -> String {
    if s == "(none)" {
        String::new()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_dump() {
        let dump = "privkey\tpubself\t9806\toff\n\
                    pub1\tpsk1\t10.0.0.1:9806\t10.240.1.0/24\t1700000000\t1024\t2048\t15\n\
                    pub2\t(none)\t(none)\t(none)\t0\t0\t0\toff\n";

        let peers = parse_peer_dump(dump).unwrap();
        assert_eq!(peers.len(), 2);

        let p1 = &peers["pub1"];
        assert_eq!(p1.endpoint, "10.0.0.1:9806");
        assert_eq!(p1.allowed_ips, "10.240.1.0/24");
        assert_eq!(p1.last_handshake, Some(1_700_000_000));
        assert_eq!(p1.bytes_rx, 1024);
        assert_eq!(p1.bytes_tx, 2048);
        assert_eq!(p1.keepalive, Some(15));

        let p2 = &peers["pub2"];
        assert_eq!(p2.endpoint, "");
        assert_eq!(p2.allowed_ips, "");
        assert_eq!(p2.last_handshake, None);
        assert_eq!(p2.keepalive, None);
    }

    #[test]
    fn test_parse_peer_dump_no_peers() {
        let peers = parse_peer_dump("privkey\tpubself\t9806\toff\n").unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn test_parse_peer_dump_malformed() {
        assert!(parse_peer_dump("header\npub1\tonly\tthree\n").is_err());
    }
}
