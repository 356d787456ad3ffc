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

//! Root side of the prepare/commit reboot
//!
//! REBOOT is only ever emitted from the transition into `Committing`, and that
//! transition requires every node of the session to have answered `Ready`.

use crate::distribution::{DistributionSession, DistributionState};
use crate::error::{OtaError, Result};
use crate::mesh::{NodeAddr, Outbound};
use crate::version::{FirmwareVersion, ensure_not_downgrade};
use crate::wire::{OtaMessage, ReadyStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootState {
    Idle,
    Preparing,
    AwaitingAcks,
    Committing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeReadiness {
    Unknown,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct RebootSession {
    pub state: RebootState,
    pub node_status: BTreeMap<NodeAddr, NodeReadiness>,
    pub deadline: Instant,
    pub delay_ms: u32,
    pub version: FirmwareVersion,
}

impl RebootSession {
    pub fn not_ready(&self) -> Vec<NodeAddr> {
        self.node_status
            .iter()
            .filter(|(_, status)| **status != NodeReadiness::Ready)
            .map(|(node, _)| *node)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebootStatus {
    pub state: RebootState,
    pub nodes_total: usize,
    pub nodes_ready: usize,
    pub not_ready: Vec<NodeAddr>,
}

/// Result of one coordinator step
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CoordinatorOutput {
    pub outbound: Vec<Outbound>,
    /// Set on the step that commits; the root must reboot itself after this delay
    pub commit_delay_ms: Option<u32>,
}

#[derive(Debug, Default)]
pub struct RebootCoordinator {
    session: Option<RebootSession>,
}

impl RebootCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RebootState {
        self.session
            .as_ref()
            .map_or(RebootState::Idle, |session| session.state)
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state(),
            RebootState::Preparing | RebootState::AwaitingAcks | RebootState::Committing
        )
    }

    /// Everything `start` checks, without touching any state.
    pub fn check_preconditions(
        &self,
        distribution: Option<&DistributionSession>,
        local_version: FirmwareVersion,
    ) -> Result<()> {
        let Some(distribution) = distribution else {
            return Err(OtaError::RejectedIncompleteDistribution {
                nodes_total: 0,
                nodes_complete: 0,
                nodes_failed: 0,
            });
        };
        ensure_not_downgrade(distribution.release().version, local_version)?;
        if self.is_busy() {
            return Err(OtaError::RejectedBusy("reboot"));
        }

        let nodes_total = distribution.nodes_total();
        let nodes_complete = distribution.nodes_complete();
        let nodes_failed = distribution.nodes_failed();
        if distribution.state() != DistributionState::Complete
            || nodes_failed != 0
            || nodes_complete != nodes_total
        {
            return Err(OtaError::RejectedIncompleteDistribution {
                nodes_total,
                nodes_complete,
                nodes_failed,
            });
        }
        Ok(())
    }

    /// Send PREPARE_REBOOT to every node of the distribution and wait for
    /// their answers until `now + timeout`.
    pub fn start(
        &mut self,
        distribution: Option<&DistributionSession>,
        local_version: FirmwareVersion,
        timeout: Duration,
        delay_ms: u32,
        now: Instant,
    ) -> Result<CoordinatorOutput> {
        self.check_preconditions(distribution, local_version)?;
        let Some(distribution) = distribution else {
            return Err(OtaError::NoReleaseStaged);
        };

        let nodes: Vec<NodeAddr> = distribution.nodes().map(|node| node.address).collect();
        let version = distribution.release().version;
        let mut session = RebootSession {
            state: RebootState::Preparing,
            node_status: nodes
                .iter()
                .map(|&node| (node, NodeReadiness::Unknown))
                .collect(),
            deadline: now + timeout,
            delay_ms,
            version,
        };

        tracing::info!(
            "Coordinated reboot into {version}: preparing {} nodes, deadline {}s",
            nodes.len(),
            timeout.as_secs()
        );

        let mut output = CoordinatorOutput {
            outbound: nodes
                .iter()
                .map(|&node| Outbound::new(node, OtaMessage::PrepareReboot))
                .collect(),
            commit_delay_ms: None,
        };
        session.state = RebootState::AwaitingAcks;

        if nodes.is_empty() {
            Self::commit(&mut session, &mut output);
        }
        self.session = Some(session);
        Ok(output)
    }

    fn commit(session: &mut RebootSession, output: &mut CoordinatorOutput) {
        session.state = RebootState::Committing;
        let delay_ms = session.delay_ms;
        output.outbound.extend(
            session
                .node_status
                .keys()
                .map(|&node| Outbound::new(node, OtaMessage::Reboot { delay_ms })),
        );
        output.commit_delay_ms = Some(delay_ms);
        tracing::info!(
            "All {} nodes ready, rebooting fleet into {} in {delay_ms} ms",
            session.node_status.len(),
            session.version
        );
    }

    fn fail(session: &mut RebootSession, reason: &str) {
        session.state = RebootState::Failed;
        let not_ready: Vec<String> = session.not_ready().iter().map(ToString::to_string).collect();
        tracing::error!(
            "Coordinated reboot aborted ({reason}), no REBOOT sent; not ready: [{}]",
            not_ready.join(", ")
        );
    }

    pub fn on_ready_ack(&mut self, from: NodeAddr, status: ReadyStatus) -> CoordinatorOutput {
        let mut output = CoordinatorOutput::default();
        let Some(session) = self.session.as_mut() else {
            return output;
        };
        if session.state != RebootState::AwaitingAcks {
            return output;
        }
        let Some(readiness) = session.node_status.get_mut(&from) else {
            tracing::debug!("READY_ACK from {from}, which is not part of the reboot");
            return output;
        };

        match status {
            ReadyStatus::Ready => {
                *readiness = NodeReadiness::Ready;
                tracing::debug!("Node {from} ready for reboot");
                if session
                    .node_status
                    .values()
                    .all(|status| *status == NodeReadiness::Ready)
                {
                    Self::commit(session, &mut output);
                }
            }
            ReadyStatus::Error => {
                *readiness = NodeReadiness::Error;
                Self::fail(session, &format!("node {from} reported an invalid image"));
            }
        }
        output
    }

    pub fn on_tick(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut()
            && session.state == RebootState::AwaitingAcks
            && now >= session.deadline
        {
            Self::fail(session, "timed out waiting for READY_ACK");
        }
    }

    pub fn status(&self) -> RebootStatus {
        match &self.session {
            Some(session) => RebootStatus {
                state: session.state,
                nodes_total: session.node_status.len(),
                nodes_ready: session
                    .node_status
                    .values()
                    .filter(|status| **status == NodeReadiness::Ready)
                    .count(),
                not_ready: session.not_ready(),
            },
            None => RebootStatus {
                state: RebootState::Idle,
                nodes_total: 0,
                nodes_ready: 0,
                not_ready: Vec::new(),
            },
        }
    }
}
