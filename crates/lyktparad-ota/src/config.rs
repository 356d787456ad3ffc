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

//! Tunables of the rollout engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_3() -> u8 {
    3
}

fn default_1000() -> u64 {
    1000
}

fn default_30() -> u64 {
    30
}

fn default_5000() -> u64 {
    5000
}

fn default_10() -> u64 {
    10
}

fn default_300() -> u64 {
    300
}

fn default_100() -> u64 {
    100
}

fn default_namespace() -> String {
    "mesh_ota".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Retries after the first attempt for transient failures
    #[serde(default = "default_3")]
    pub max_retries: u8,

    #[serde(default = "default_1000")]
    pub retry_delay_ms: u64,

    /// Timeout for connecting and for each read of the body
    #[serde(default = "default_30")]
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

impl DownloadConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// How long to wait for a node to acknowledge a block
    #[serde(default = "default_5000")]
    pub block_timeout_ms: u64,

    /// Resends per (node, block) before the node is marked failed
    #[serde(default = "default_3")]
    pub max_block_retries: u8,

    /// Interval of STATUS queries from the root, 0 disables polling
    #[serde(default = "default_30")]
    pub status_poll_secs: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            block_timeout_ms: 5000,
            max_block_retries: 3,
            status_poll_secs: 30,
        }
    }
}

impl DistributionConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootConfig {
    /// Default prepare-phase deadline
    #[serde(default = "default_10")]
    pub timeout_secs: u64,

    /// Default delay between REBOOT and the actual restart
    #[serde(default = "default_1000")]
    pub delay_ms: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Time a freshly switched node gets to rejoin the mesh
    #[serde(default = "default_300")]
    pub connect_timeout_secs: u64,

    /// Failed boots after which automatic rollback stops
    #[serde(default = "default_3")]
    pub max_attempts: u8,

    /// Directory name of the persisted state under the data dir
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 300,
            max_attempts: 3,
            namespace: default_namespace(),
        }
    }
}

impl RollbackConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub reboot: RebootConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Resolution of protocol timeouts
    #[serde(default = "default_100")]
    pub tick_interval_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            distribution: DistributionConfig::default(),
            reboot: RebootConfig::default(),
            rollback: RollbackConfig::default(),
            tick_interval_ms: 100,
        }
    }
}

impl OtaConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
