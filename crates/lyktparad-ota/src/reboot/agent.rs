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

use crate::error::Result;
use crate::image::ImageStore;
use crate::state::StateStore;
use crate::version::{FirmwareVersion, ensure_not_downgrade};
use crate::wire::ReadyStatus;
use std::time::{Duration, Instant};

/// Node side of the coordinated reboot; the root runs it for itself too.
#[derive(Debug, Default)]
pub struct RebootAgent {
    restart_at: Option<Instant>,
}

impl RebootAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time at which a committed reboot restarts the node.
    pub fn restart_at(&self) -> Option<Instant> {
        self.restart_at
    }

    pub fn on_prepare(&self, store: &mut ImageStore) -> ReadyStatus {
        match store.validate_inactive() {
            Ok(release) => {
                tracing::info!("Ready to reboot into {}", release.version);
                ReadyStatus::Ready
            }
            Err(e) => {
                tracing::warn!("Not ready to reboot: {e}");
                ReadyStatus::Error
            }
        }
    }

    /// Select the new image for boot, persist the rollback marker and
    /// schedule the restart.
    ///
    /// On error neither the boot selection nor the persisted state change.
    pub fn on_reboot(
        &mut self,
        delay_ms: u32,
        running: FirmwareVersion,
        store: &mut ImageStore,
        state_store: &dyn StateStore,
        now: Instant,
    ) -> Result<Instant> {
        if let Some(restart_at) = self.restart_at {
            return Ok(restart_at);
        }

        let release = store.validate_inactive()?;
        ensure_not_downgrade(release.version, running)?;

        let mut state = state_store.load()?;
        state.rollback_pending = true;
        state.rollback_attempts = 0;

        let slot = store.boot_inactive()?;
        if let Err(e) = state_store.save(&state) {
            if let Err(revert) = store.boot_running() {
                tracing::error!(
                    "Failed to restore boot selection to slot {}: {revert}",
                    store.running_slot()
                );
            }
            return Err(e);
        }
        let restart_at = now + Duration::from_millis(u64::from(delay_ms));
        self.restart_at = Some(restart_at);
        tracing::warn!(
            "Switching to firmware {} in slot {slot}, restarting in {delay_ms} ms",
            release.version
        );
        Ok(restart_at)
    }
}
