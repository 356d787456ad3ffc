// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Lyktparad.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use anyhow::{Context, Result};
use lyktparad_ota::{FirmwareVersion, NodeAddr, NodeRole, OtaConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host node configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,

    pub mesh: MeshConfig,

    #[serde(default)]
    pub web: WebConfig,

    /// Rollout engine tuning
    #[serde(default)]
    pub ota: OtaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Station address of this node, e.g. "24:0a:c4:00:00:01"
    pub address: NodeAddr,

    pub role: NodeRole,

    /// Flash slots and persisted OTA state live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Version reported while the running slot holds no image
    #[serde(default = "default_factory_version")]
    pub factory_version: FirmwareVersion,

    /// Size of each firmware slot in bytes
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// UDP socket this node listens on
    pub listen: SocketAddr,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Root only: URL probed to decide whether the uplink is up
    #[serde(default)]
    pub uplink_probe_url: Option<String>,

    /// Interval of link heartbeats; a link is lost after three missed ones
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl MeshConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: NodeAddr,

    pub endpoint: SocketAddr,

    /// Upstream link of a non-root node
    #[serde(default)]
    pub parent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,

    /// Only honored on the root
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            enabled: true,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/lyktparad")
}

fn default_factory_version() -> FirmwareVersion {
    FirmwareVersion::new(0, 1, 0)
}

fn default_slot_capacity() -> u32 {
    4 * 1024 * 1024
}

fn default_heartbeat_secs() -> u64 {
    2
}

fn default_web_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Read and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for peer in &self.mesh.peers {
            if peer.address == self.node.address {
                anyhow::bail!("Peer list contains this node's own address {}", peer.address);
            }
            if !seen.insert(peer.address) {
                anyhow::bail!("Peer {} is listed more than once", peer.address);
            }
        }

        let parents = self.mesh.peers.iter().filter(|peer| peer.parent).count();
        match self.node.role {
            NodeRole::Root if parents > 0 => {
                anyhow::bail!("The root node cannot have a parent peer");
            }
            NodeRole::Node if parents != 1 => {
                anyhow::bail!("A non-root node needs exactly one parent peer, found {parents}");
            }
            NodeRole::Root | NodeRole::Node => {}
        }

        if self.mesh.heartbeat_secs == 0 {
            anyhow::bail!("heartbeat_secs must be at least 1");
        }
        if self.ota.tick_interval_ms == 0 {
            anyhow::bail!("ota.tick_interval_ms must be positive");
        }
        if self.ota.rollback.max_attempts == 0 {
            anyhow::bail!("ota.rollback.max_attempts must be positive");
        }
        Ok(())
    }

    pub fn parent(&self) -> Option<&PeerConfig> {
        self.mesh.peers.iter().find(|peer| peer.parent)
    }
}
