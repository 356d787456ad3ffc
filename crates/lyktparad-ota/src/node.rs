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

//! Node runtime
//!
//! One task owns every rollout state machine of a node and feeds them mesh
//! traffic, control commands and timer ticks one at a time. The machines never
//! see the clock or the transport directly: they get `now` and return the
//! frames to send.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::bridge::{OtaCommand, OtaCommandChannel, VersionInfo};
use crate::config::OtaConfig;
use crate::distribution::{DistributionAgent, DistributionOrchestrator};
use crate::download::DownloadManager;
use crate::error::{OtaError, Result};
use crate::image::{FlashPartitions, ImageStore};
use crate::mesh::{MeshEvent, MeshTransport, NodeAddr, NodeRole, Outbound};
use crate::reboot::{CoordinatorOutput, RebootAgent, RebootCoordinator};
use crate::rollback::{RollbackWatchdog, WatchdogAction};
use crate::state::StateStore;
use crate::version::{FirmwareVersion, ensure_not_downgrade};
use crate::wire::OtaMessage;

/// Why [`OtaNode::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// Firmware switch or rollback: reopen the partitions and boot again
    Restart,
    /// The mesh transport went away
    Shutdown,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[derive(Debug)]
pub struct OtaNode {
    config: OtaConfig,
    role: NodeRole,
    transport: Arc<dyn MeshTransport>,
    store: Arc<Mutex<ImageStore>>,
    state_store: Arc<dyn StateStore>,
    running_version: FirmwareVersion,
    download: DownloadManager,
    orchestrator: DistributionOrchestrator,
    distribution_agent: DistributionAgent,
    coordinator: RebootCoordinator,
    reboot_agent: RebootAgent,
    watchdog: RollbackWatchdog,
    restart_at: Option<Instant>,
}

impl OtaNode {
    /// Open the image store, reconcile persisted state and arm the rollback
    /// watchdog if the previous boot was a rollout reboot.
    pub fn boot(
        config: OtaConfig,
        role: NodeRole,
        transport: Arc<dyn MeshTransport>,
        partitions: Box<dyn FlashPartitions>,
        state_store: Arc<dyn StateStore>,
        factory_version: FirmwareVersion,
    ) -> Result<Self> {
        let store = ImageStore::new(partitions);
        let running_slot = store.running_slot();
        let running_version = store.running_version().unwrap_or(factory_version);

        let mut state = state_store.load()?;
        if !state.rollback_pending && state.record_running_version(running_version) {
            state_store.save(&state)?;
        }

        let mut watchdog = RollbackWatchdog::new(config.rollback.clone());
        watchdog.on_boot(&state, now());

        tracing::info!(
            "Node {} booted firmware {running_version} from slot {running_slot} as {role:?}",
            transport.local_addr()
        );

        let store = Arc::new(Mutex::new(store));
        let download = DownloadManager::new(config.download.clone(), Arc::clone(&store))?;

        Ok(Self {
            orchestrator: DistributionOrchestrator::new(config.distribution.clone()),
            config,
            role,
            transport,
            store,
            state_store,
            running_version,
            download,
            distribution_agent: DistributionAgent::new(),
            coordinator: RebootCoordinator::new(),
            reboot_agent: RebootAgent::new(),
            watchdog,
            restart_at: None,
        })
    }

    pub fn running_version(&self) -> FirmwareVersion {
        self.running_version
    }

    /// Drive the node until it has to restart or the mesh goes away. The
    /// command channel outlives the node so control handles stay valid across
    /// restarts.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MeshEvent>,
        commands: &mut OtaCommandChannel,
    ) -> NodeExit {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let poll_secs = self.config.distribution.status_poll_secs;
        let polling = self.role == NodeRole::Root && poll_secs > 0;
        let mut poll = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut commands_open = true;

        loop {
            let restart_at = self.restart_at.map(tokio::time::Instant::from_std);

            tokio::select! {
                () = tokio::time::sleep_until(restart_at.unwrap_or_else(tokio::time::Instant::now)), if restart_at.is_some() => {
                    tracing::warn!("Restarting node");
                    return NodeExit::Restart;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::info!("Mesh transport closed, stopping node");
                        return NodeExit::Shutdown;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
                _ = tick.tick() => self.on_tick().await,
                _ = poll.tick(), if polling => self.poll_status().await,
            }
        }
    }

    async fn send_all(&self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            tracing::trace!("-> {to} {}", message.name());
            if let Err(e) = self.transport.send(to, message.encode()).await {
                tracing::warn!("Failed to send {} to {to}: {e}", message.name());
            }
        }
    }

    async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Frame { from, payload } => match OtaMessage::decode(&payload) {
                Ok(message) => self.handle_message(from, message).await,
                Err(e) => tracing::warn!("Malformed OTA frame from {from}: {e}"),
            },
            MeshEvent::Connected => {
                tracing::info!("Mesh connectivity established");
                if let Err(e) = self
                    .watchdog
                    .on_connected(self.running_version, self.state_store.as_ref())
                {
                    tracing::error!("Failed to commit firmware: {e}");
                }
            }
            MeshEvent::Disconnected => tracing::warn!("Mesh connectivity lost"),
        }
    }

    async fn handle_message(&mut self, from: NodeAddr, message: OtaMessage) {
        let now = now();
        let is_root = self.role == NodeRole::Root;
        tracing::trace!("<- {from} {}", message.name());

        let outbound = match message {
            OtaMessage::Request { version } if is_root => {
                self.orchestrator.record_version(from, version);
                if self.orchestrator.is_distributing() {
                    Vec::new()
                } else {
                    tracing::info!("Node {from} (running {version}) requests the staged firmware");
                    self.start_distribution(now).unwrap_or_else(|e| {
                        tracing::warn!("Cannot serve firmware request from {from}: {e}");
                        Vec::new()
                    })
                }
            }
            OtaMessage::Start {
                block_count,
                size,
                version,
            } => {
                let mut store = self.store.lock();
                if let Err(e) = self.distribution_agent.on_start(
                    from,
                    block_count,
                    size,
                    version,
                    self.running_version,
                    &mut store,
                ) {
                    tracing::warn!("Rejected START for {version} from {from}: {e}");
                }
                Vec::new()
            }
            OtaMessage::Block { index, crc32, data } => {
                let mut store = self.store.lock();
                self.distribution_agent
                    .on_block(from, index, crc32, &data, &mut store)
                    .into_iter()
                    .collect()
            }
            OtaMessage::Ack { index } if is_root => self.orchestrator.on_ack(from, index, now),
            OtaMessage::Status { available } => {
                let store = self.store.lock();
                self.distribution_agent
                    .on_status(from, available, self.running_version, &store)
            }
            OtaMessage::PrepareReboot => {
                let status = self.reboot_agent.on_prepare(&mut self.store.lock());
                vec![Outbound::new(from, OtaMessage::ReadyAck { status })]
            }
            OtaMessage::Reboot { delay_ms } => {
                self.schedule_reboot(delay_ms, now);
                Vec::new()
            }
            OtaMessage::ReadyAck { status } if is_root => {
                let output = self.coordinator.on_ready_ack(from, status);
                self.apply_coordinator(output, now)
            }
            OtaMessage::StatusReport { running, staged } if is_root => {
                tracing::debug!(
                    "Node {from} runs {running}, staged {}",
                    staged.map_or_else(|| "nothing".to_owned(), |v| v.to_string())
                );
                self.orchestrator.record_version(from, running);
                Vec::new()
            }
            OtaMessage::Unknown { tag } => {
                tracing::warn!("Unknown OTA command {tag:#04x} from {from}");
                Vec::new()
            }
            message @ (OtaMessage::Request { .. }
            | OtaMessage::Ack { .. }
            | OtaMessage::ReadyAck { .. }
            | OtaMessage::StatusReport { .. }) => {
                tracing::debug!("Ignoring {} from {from}: not the root", message.name());
                Vec::new()
            }
        };

        self.send_all(outbound).await;
    }

    fn schedule_reboot(&mut self, delay_ms: u32, now: Instant) {
        let result = {
            let mut store = self.store.lock();
            self.reboot_agent.on_reboot(
                delay_ms,
                self.running_version,
                &mut store,
                self.state_store.as_ref(),
                now,
            )
        };
        match result {
            Ok(restart_at) => self.restart_at = Some(restart_at),
            Err(e) => tracing::error!("Cannot switch to the staged firmware: {e}"),
        }
    }

    fn apply_coordinator(&mut self, output: CoordinatorOutput, now: Instant) -> Vec<Outbound> {
        if let Some(delay_ms) = output.commit_delay_ms {
            self.schedule_reboot(delay_ms, now);
        }
        output.outbound
    }

    async fn handle_command(&mut self, command: OtaCommand) {
        match command {
            OtaCommand::StartDownload {
                url,
                version,
                reply,
            } => {
                let _ = reply.send(self.start_download(&url, version));
            }
            OtaCommand::DownloadStatus { reply } => {
                let _ = reply.send(self.download.status());
            }
            OtaCommand::CancelDownload { reply } => {
                let result = self
                    .require_root()
                    .and_then(|()| self.download.cancel_download());
                let _ = reply.send(result);
            }
            OtaCommand::StartDistribution { reply } => {
                let result = self.start_distribution(now());
                let result = match result {
                    Ok(outbound) => {
                        self.send_all(outbound).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            OtaCommand::DistributionStatus { reply } => {
                let _ = reply.send(self.orchestrator.status());
            }
            OtaCommand::CancelDistribution { reply } => {
                let result = self.require_root().map(|()| {
                    self.orchestrator.cancel();
                });
                let _ = reply.send(result);
            }
            OtaCommand::StartReboot {
                timeout_secs,
                delay_ms,
                reply,
            } => {
                let result = match self.start_reboot(timeout_secs, delay_ms, now()) {
                    Ok(outbound) => {
                        self.send_all(outbound).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            OtaCommand::RebootStatus { reply } => {
                let _ = reply.send(self.coordinator.status());
            }
            OtaCommand::Version { reply } => {
                let _ = reply.send(self.version_info());
            }
        }
    }

    fn require_root(&self) -> Result<()> {
        if self.role == NodeRole::Root {
            Ok(())
        } else {
            Err(OtaError::NotRoot)
        }
    }

    fn start_download(&mut self, url: &str, version: Option<FirmwareVersion>) -> Result<()> {
        self.require_root()?;
        if let Some(version) = version {
            ensure_not_downgrade(version, self.running_version)?;
        }
        if self.orchestrator.is_distributing() {
            return Err(OtaError::RejectedBusy("distribution"));
        }
        if self.coordinator.is_busy() {
            return Err(OtaError::RejectedBusy("reboot"));
        }
        self.download
            .start_download(url, version, self.running_version)
    }

    fn start_distribution(&mut self, now: Instant) -> Result<Vec<Outbound>> {
        self.require_root()?;
        // A running download is about to overwrite the inactive slot
        if self.download.is_downloading() {
            return Err(OtaError::RejectedBusy("download"));
        }
        let (release, image) = {
            let store = self.store.lock();
            let release = store.ready_release().ok_or(OtaError::NoReleaseStaged)?;
            (release, store.read_image()?)
        };
        ensure_not_downgrade(release.version, self.running_version)?;
        if self.coordinator.is_busy() {
            return Err(OtaError::RejectedBusy("reboot"));
        }

        let peers = self.transport.routing_table();
        self.orchestrator
            .start(release, image, &peers, self.running_version, now)
    }

    fn start_reboot(
        &mut self,
        timeout_secs: Option<u64>,
        delay_ms: Option<u32>,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        self.require_root()?;
        let distribution = self.orchestrator.session();
        self.coordinator
            .check_preconditions(distribution, self.running_version)?;
        if self.download.is_downloading() {
            return Err(OtaError::RejectedBusy("download"));
        }

        // The root switches too, so its own staged image must be the distributed one
        let staged = self.store.lock().validate_inactive()?;
        if distribution.map(|session| session.release()) != Some(staged) {
            return Err(OtaError::PartitionInvalid(format!(
                "staged image {} is not the distributed release",
                staged.version
            )));
        }

        let timeout = Duration::from_secs(timeout_secs.unwrap_or(self.config.reboot.timeout_secs));
        let delay_ms = delay_ms
            .unwrap_or_else(|| u32::try_from(self.config.reboot.delay_ms).unwrap_or(u32::MAX));
        let output =
            self.coordinator
                .start(distribution, self.running_version, timeout, delay_ms, now)?;
        Ok(self.apply_coordinator(output, now))
    }

    async fn on_tick(&mut self) {
        let now = now();

        let outbound = self.orchestrator.on_tick(now);
        self.send_all(outbound).await;

        self.coordinator.on_tick(now);

        let action = {
            let mut store = self.store.lock();
            self.watchdog
                .on_tick(now, self.state_store.as_ref(), &mut store)
        };
        match action {
            Ok(WatchdogAction::Restart) => self.restart_at = Some(now),
            Ok(WatchdogAction::None) => {}
            Err(e) => tracing::error!("Rollback watchdog failed: {e}"),
        }
    }

    /// Ask every peer for its versions, advertising the staged release.
    async fn poll_status(&self) {
        let available = self
            .store
            .lock()
            .ready_release()
            .map(|release| release.version);
        let outbound = self
            .transport
            .routing_table()
            .into_iter()
            .map(|peer| Outbound::new(peer, OtaMessage::Status { available }))
            .collect();
        self.send_all(outbound).await;
    }

    fn version_info(&self) -> VersionInfo {
        let store = self.store.lock();
        VersionInfo {
            version: self.running_version,
            role: self.role,
            running_slot: store.running_slot(),
            staged: store.ready_release().map(|release| release.version),
            rollback_pending: self.watchdog.is_armed(),
        }
    }
}
