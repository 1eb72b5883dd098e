use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub commit: String,
    pub timestamp: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        // build metadata is stamped into the binary by build.rs
        let commit = env!("WORMHOLE_GIT_COMMIT");
        let dirty = env!("WORMHOLE_GIT_DIRTY") == "true";
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: if dirty {
                format!("{commit}-dirty")
            } else {
                commit.to_string()
            },
            timestamp: env!("WORMHOLE_BUILD_TIMESTAMP").to_string(),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version:         {}", self.version)?;
        writeln!(f, "Hash:            {}", self.commit)?;
        write!(f, "Build Timestamp: {}", self.timestamp)
    }
}
