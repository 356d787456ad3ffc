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

//! Per-node state that survives reboots and power loss

use crate::error::{OtaError, Result};
use crate::version::{FirmwareVersion, is_downgrade};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STATE_FILE: &str = "ota_state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PersistentOtaState {
    /// Set right before a rollout reboot, cleared once the node rejoins the mesh
    #[serde(default)]
    pub rollback_pending: bool,

    /// Consecutive boots that failed to rejoin the mesh
    #[serde(default)]
    pub rollback_attempts: u8,

    /// Last firmware version known to run well on this node
    #[serde(default)]
    pub current_version: Option<FirmwareVersion>,

    /// When the current firmware was committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl PersistentOtaState {
    /// Reconcile the stored version with the firmware that just booted.
    ///
    /// Returns true when the state changed and needs saving.
    pub fn record_running_version(&mut self, running: FirmwareVersion) -> bool {
        match self.current_version {
            None => {
                tracing::info!("Storing firmware version {running} on first boot");
                self.current_version = Some(running);
                true
            }
            Some(stored) if is_downgrade(stored, running) => {
                tracing::info!("Firmware version updated: {stored} -> {running}");
                self.current_version = Some(running);
                true
            }
            Some(stored) if is_downgrade(running, stored) => {
                tracing::warn!(
                    "Running firmware {running} is older than stored version {stored}, keeping stored version"
                );
                false
            }
            Some(_) => false,
        }
    }
}

/// Storage for [`PersistentOtaState`]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    fn load(&self) -> Result<PersistentOtaState>;

    fn save(&self, state: &PersistentOtaState) -> Result<()>;
}

/// JSON file at `<data_dir>/<namespace>/ota_state.json`
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(data_dir: impl AsRef<Path>, namespace: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(namespace).join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<PersistentOtaState> {
        if !self.path.exists() {
            return Ok(PersistentOtaState::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| OtaError::State(format!("Failed to read state: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| OtaError::State(format!("Failed to parse state: {e}")))
    }

    fn save(&self, state: &PersistentOtaState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OtaError::State(format!("Failed to create state dir: {e}")))?;
        }
        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(state)?;

        // Atomic write
        std::fs::write(&temp_path, content)
            .and_then(|()| std::fs::rename(&temp_path, &self.path))
            .map_err(|e| OtaError::State(format!("Failed to write state: {e}")))
    }
}

/// In-memory store; clones share the same state, like NVS across a reboot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<PersistentOtaState>>,
}

impl MemoryStateStore {
    pub fn new(state: PersistentOtaState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> PersistentOtaState {
        self.state.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistentOtaState> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistentOtaState) -> Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}
