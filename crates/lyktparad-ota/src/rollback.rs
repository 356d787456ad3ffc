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

//! Rollback watchdog for nodes that switched firmware and cannot rejoin the mesh

use crate::config::RollbackConfig;
use crate::error::Result;
use crate::image::ImageStore;
use crate::state::{PersistentOtaState, StateStore};
use crate::version::FirmwareVersion;
use chrono::Utc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    /// The previous slot was selected for boot, restart now
    Restart,
}

#[derive(Debug)]
pub struct RollbackWatchdog {
    config: RollbackConfig,
    deadline: Option<Instant>,
}

impl RollbackWatchdog {
    pub fn new(config: RollbackConfig) -> Self {
        Self {
            config,
            deadline: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Arm the connectivity deadline if the last reboot came from a rollout.
    pub fn on_boot(&mut self, state: &PersistentOtaState, now: Instant) {
        if !state.rollback_pending {
            return;
        }
        if state.rollback_attempts >= self.config.max_attempts {
            tracing::warn!(
                "Rollback limit of {} attempts reached, no further automatic rollback",
                self.config.max_attempts
            );
        }
        self.deadline = Some(now + self.config.connect_timeout());
        tracing::info!(
            "Rollback pending (attempt {}), waiting {}s for mesh connectivity",
            state.rollback_attempts,
            self.config.connect_timeout_secs
        );
    }

    /// Connectivity reached: commit the running firmware.
    pub fn on_connected(
        &mut self,
        running: FirmwareVersion,
        state_store: &dyn StateStore,
    ) -> Result<bool> {
        if self.deadline.take().is_none() {
            return Ok(false);
        }

        let mut state = state_store.load()?;
        state.rollback_pending = false;
        state.rollback_attempts = 0;
        state.record_running_version(running);
        state.committed_at = Some(Utc::now());
        state_store.save(&state)?;

        tracing::info!("Mesh connectivity confirmed, firmware {running} committed");
        Ok(true)
    }

    pub fn on_tick(
        &mut self,
        now: Instant,
        state_store: &dyn StateStore,
        store: &mut ImageStore,
    ) -> Result<WatchdogAction> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.deadline = None,
            Some(_) | None => return Ok(WatchdogAction::None),
        }

        let mut state = state_store.load()?;
        if state.rollback_attempts >= self.config.max_attempts {
            tracing::error!(
                "No mesh connectivity and rollback attempts exhausted ({}), staying on current firmware",
                state.rollback_attempts
            );
            return Ok(WatchdogAction::None);
        }

        state.rollback_attempts += 1;
        state_store.save(&state)?;

        if state.rollback_attempts < self.config.max_attempts {
            let slot = store.boot_other()?;
            tracing::warn!(
                "No mesh connectivity within {}s, rolling back to slot {slot} (attempt {}/{})",
                self.config.connect_timeout_secs,
                state.rollback_attempts,
                self.config.max_attempts
            );
            Ok(WatchdogAction::Restart)
        } else {
            tracing::error!(
                "No mesh connectivity after {} rollback attempts, stopping automatic rollback",
                state.rollback_attempts
            );
            Ok(WatchdogAction::None)
        }
    }
}
