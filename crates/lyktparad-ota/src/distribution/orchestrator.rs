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

//! Root side of block distribution
//!
//! Blocks go out in index order. Block `i + 1` is only sent once every node
//! still in the session has acknowledged block `i` or has been marked failed.
//! A node that stays silent for `block_timeout` gets the block again, up to
//! `max_block_retries` times per block, after which it is dropped from the
//! session while the others carry on.

use super::blockset::BlockSet;
use crate::config::DistributionConfig;
use crate::error::{OtaError, Result};
use crate::image::{BLOCK_SIZE, FirmwareRelease};
use crate::mesh::{NodeAddr, Outbound};
use crate::version::{FirmwareVersion, ensure_not_downgrade};
use crate::wire::OtaMessage;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionState {
    Idle,
    Distributing,
    Complete,
    Failed,
    Cancelled,
}

/// Replication progress of one peer
#[derive(Debug, Clone)]
pub struct NodeProgress {
    pub address: NodeAddr,
    pub blocks_acked: BlockSet,
    /// Resends left per block, created on the first timeout of that block
    pub retries_remaining: BTreeMap<u16, u8>,
    pub failed: bool,
    /// Block sent and not yet acknowledged, with the time of the last send
    awaiting: Option<(u16, Instant)>,
}

impl NodeProgress {
    fn new(address: NodeAddr, block_count: u16) -> Self {
        Self {
            address,
            blocks_acked: BlockSet::new(block_count),
            retries_remaining: BTreeMap::new(),
            failed: false,
            awaiting: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.failed && self.blocks_acked.is_full()
    }
}

#[derive(Debug, Clone)]
pub struct DistributionSession {
    release: FirmwareRelease,
    blocks: Vec<Bytes>,
    nodes: BTreeMap<NodeAddr, NodeProgress>,
    state: DistributionState,
    current_block: u16,
    acked_total: u32,
    logged_decile: u32,
}

impl DistributionSession {
    pub fn release(&self) -> FirmwareRelease {
        self.release
    }

    pub fn state(&self) -> DistributionState {
        self.state
    }

    pub fn node(&self, address: NodeAddr) -> Option<&NodeProgress> {
        self.nodes.get(&address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeProgress> {
        self.nodes.values()
    }

    pub fn nodes_total(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes_complete(&self) -> usize {
        self.nodes.values().filter(|node| node.is_complete()).count()
    }

    pub fn nodes_failed(&self) -> usize {
        self.nodes.values().filter(|node| node.failed).count()
    }

    fn denominator(&self) -> u32 {
        let nodes = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
        u32::from(self.release.block_count).saturating_mul(nodes)
    }

    /// `sum(blocks_acked) / (block_count * node_count)`
    pub fn overall_progress(&self) -> f64 {
        match self.denominator() {
            0 if self.state == DistributionState::Complete => 1.0,
            0 => 0.0,
            denominator => f64::from(self.acked_total) / f64::from(denominator),
        }
    }

    fn block_message(&self, index: u16) -> Option<OtaMessage> {
        self.blocks
            .get(usize::from(index))
            .map(|data| OtaMessage::block(index, data.clone()))
    }

    fn start_message(&self) -> OtaMessage {
        OtaMessage::Start {
            block_count: self.release.block_count,
            size: self.release.size,
            version: self.release.version,
        }
    }

    /// Move the block cursor forward and send the current block to every
    /// eligible node that has not been sent it yet.
    fn advance(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        while self.state == DistributionState::Distributing {
            let index = self.current_block;
            if index >= self.release.block_count {
                self.finish();
                break;
            }

            let Some(message) = self.block_message(index) else {
                break;
            };

            let mut pending = false;
            for node in self
                .nodes
                .values_mut()
                .filter(|node| !node.failed && !node.blocks_acked.contains(index))
            {
                pending = true;
                if node.awaiting.is_none() {
                    out.push(Outbound::new(node.address, message.clone()));
                    node.awaiting = Some((index, now));
                }
            }

            if pending {
                break;
            }
            self.current_block += 1;
        }

        out
    }

    fn finish(&mut self) {
        let failed = self.nodes_failed();
        if !self.nodes.is_empty() && failed == self.nodes.len() {
            self.state = DistributionState::Failed;
            tracing::error!(
                "Distribution of {} failed: all {failed} nodes failed",
                self.release.version
            );
        } else {
            self.state = DistributionState::Complete;
            tracing::info!(
                "Distribution of {} finished: {} of {} nodes complete, {failed} failed",
                self.release.version,
                self.nodes_complete(),
                self.nodes.len()
            );
        }
    }

    fn log_progress(&mut self) {
        let decile = (self.acked_total.saturating_mul(10))
            .checked_div(self.denominator())
            .unwrap_or(0);
        if decile > self.logged_decile {
            self.logged_decile = decile;
            tracing::info!(
                "Distribution progress: {}% ({}/{} blocks acknowledged)",
                decile * 10,
                self.acked_total,
                self.denominator()
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionStatus {
    pub distributing: bool,
    pub total_blocks: u16,
    pub current_block: u16,
    pub overall_progress: f64,
    pub nodes_total: usize,
    pub nodes_complete: usize,
    pub nodes_failed: usize,
}

#[derive(Debug)]
pub struct DistributionOrchestrator {
    config: DistributionConfig,
    session: Option<DistributionSession>,
    node_versions: BTreeMap<NodeAddr, FirmwareVersion>,
}

impl DistributionOrchestrator {
    pub fn new(config: DistributionConfig) -> Self {
        Self {
            config,
            session: None,
            node_versions: BTreeMap::new(),
        }
    }

    /// Remember the running version a node reported.
    pub fn record_version(&mut self, node: NodeAddr, version: FirmwareVersion) {
        if self.node_versions.insert(node, version) != Some(version) {
            tracing::debug!("Node {node} reports firmware {version}");
        }
    }

    pub fn node_versions(&self) -> &BTreeMap<NodeAddr, FirmwareVersion> {
        &self.node_versions
    }

    pub fn session(&self) -> Option<&DistributionSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> DistributionState {
        self.session
            .as_ref()
            .map_or(DistributionState::Idle, DistributionSession::state)
    }

    pub fn is_distributing(&self) -> bool {
        self.state() == DistributionState::Distributing
    }

    /// Start replicating `image` to `peers`.
    ///
    /// A previous session of the same release that was cancelled is resumed:
    /// peers keep the blocks they already acknowledged.
    pub fn start(
        &mut self,
        release: FirmwareRelease,
        image: Bytes,
        peers: &[NodeAddr],
        local_version: FirmwareVersion,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        ensure_not_downgrade(release.version, local_version)?;
        if let Some(&newest) = self.node_versions.values().max() {
            ensure_not_downgrade(release.version, newest)?;
        }
        if self.is_distributing() {
            return Err(OtaError::RejectedBusy("distribution"));
        }
        if image.len() != release.size as usize {
            return Err(OtaError::PartitionInvalid(format!(
                "image is {} bytes, release declares {}",
                image.len(),
                release.size
            )));
        }

        let blocks: Vec<Bytes> = (0..release.block_count)
            .map(|index| {
                let start = u32::from(index) * BLOCK_SIZE;
                let end = start + release.block_len(index);
                image.slice(start as usize..end as usize)
            })
            .collect();

        let previous = self.session.take().filter(|session| {
            session.state == DistributionState::Cancelled && session.release == release
        });

        let mut nodes = BTreeMap::new();
        let mut acked_total = 0u32;
        for &peer in peers {
            let mut progress = NodeProgress::new(peer, release.block_count);
            if let Some(previous) = previous.as_ref().and_then(|session| session.nodes.get(&peer)) {
                progress.blocks_acked = previous.blocks_acked.clone();
                acked_total += u32::from(progress.blocks_acked.count());
            }
            nodes.insert(peer, progress);
        }

        if previous.is_some() {
            tracing::info!(
                "Resuming distribution of {} to {} nodes ({acked_total} blocks already acknowledged)",
                release.version,
                nodes.len()
            );
        } else {
            tracing::info!(
                "Starting distribution of {} ({} bytes, {} blocks) to {} nodes",
                release.version,
                release.size,
                release.block_count,
                nodes.len()
            );
        }

        let mut session = DistributionSession {
            release,
            blocks,
            nodes,
            state: DistributionState::Distributing,
            current_block: 0,
            acked_total,
            logged_decile: 0,
        };

        let start = session.start_message();
        let mut out: Vec<Outbound> = peers
            .iter()
            .map(|&peer| Outbound::new(peer, start.clone()))
            .collect();
        out.extend(session.advance(now));

        self.session = Some(session);
        Ok(out)
    }

    pub fn on_ack(&mut self, from: NodeAddr, index: u16, now: Instant) -> Vec<Outbound> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state != DistributionState::Distributing {
            return Vec::new();
        }
        let Some(node) = session.nodes.get_mut(&from) else {
            tracing::debug!("ACK {index} from {from}, which is not part of the distribution");
            return Vec::new();
        };
        if node.failed {
            return Vec::new();
        }

        if node.blocks_acked.insert(index) {
            session.acked_total += 1;
            if node.blocks_acked.is_full() {
                tracing::info!("Node {from} received all {} blocks", session.release.block_count);
            }
        }
        if node.awaiting.is_some_and(|(awaited, _)| awaited == index) {
            node.awaiting = None;
        }

        session.log_progress();
        session.advance(now)
    }

    /// Handle ack timeouts.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Outbound> {
        let timeout = self.config.block_timeout();
        let max_retries = self.config.max_block_retries;
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state != DistributionState::Distributing {
            return Vec::new();
        }

        let start = session.start_message();
        let mut out = Vec::new();
        for node in session.nodes.values_mut().filter(|node| !node.failed) {
            let Some((index, sent_at)) = node.awaiting else {
                continue;
            };
            if now.saturating_duration_since(sent_at) < timeout {
                continue;
            }

            let remaining = node.retries_remaining.entry(index).or_insert(max_retries);
            if *remaining == 0 {
                node.failed = true;
                node.awaiting = None;
                tracing::warn!(
                    "Node {} marked failed after {max_retries} retries on block {index}",
                    node.address
                );
                continue;
            }

            *remaining -= 1;
            tracing::warn!(
                "Block {index} to {} timed out, resending ({} retries left)",
                node.address,
                *remaining
            );
            if node.blocks_acked.is_empty() {
                out.push(Outbound::new(node.address, start.clone()));
            }
            if let Some(block) = session.blocks.get(usize::from(index)) {
                out.push(Outbound::new(node.address, OtaMessage::block(index, block.clone())));
            }
            node.awaiting = Some((index, now));
        }

        out.extend(session.advance(now));
        out
    }

    /// Stop sending. Peers keep the blocks they have.
    pub fn cancel(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != DistributionState::Distributing {
            return false;
        }
        session.state = DistributionState::Cancelled;
        for node in session.nodes.values_mut() {
            node.awaiting = None;
        }
        tracing::info!(
            "Distribution of {} cancelled at block {}/{}",
            session.release.version,
            session.current_block,
            session.release.block_count
        );
        true
    }

    pub fn status(&self) -> DistributionStatus {
        match &self.session {
            Some(session) => DistributionStatus {
                distributing: session.state == DistributionState::Distributing,
                total_blocks: session.release.block_count,
                current_block: session.current_block,
                overall_progress: session.overall_progress(),
                nodes_total: session.nodes_total(),
                nodes_complete: session.nodes_complete(),
                nodes_failed: session.nodes_failed(),
            },
            None => DistributionStatus {
                distributing: false,
                total_blocks: 0,
                current_block: 0,
                overall_progress: 0.0,
                nodes_total: 0,
                nodes_complete: 0,
                nodes_failed: 0,
            },
        }
    }
}
