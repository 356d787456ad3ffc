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

//! Receiving side of block distribution, runs on every node

use super::blockset::BlockSet;
use crate::error::{OtaError, Result};
use crate::image::{BLOCK_SIZE, FirmwareRelease, ImageStore, InactiveSlot};
use crate::mesh::{NodeAddr, Outbound};
use crate::version::{FirmwareVersion, ensure_not_downgrade, is_downgrade};
use crate::wire::OtaMessage;

#[derive(Debug, Clone)]
struct Reception {
    release: FirmwareRelease,
    received: BlockSet,
    complete: bool,
}

#[derive(Debug, Default)]
pub struct DistributionAgent {
    reception: Option<Reception>,
}

impl DistributionAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release currently being received or already received.
    pub fn release(&self) -> Option<FirmwareRelease> {
        self.reception.as_ref().map(|reception| reception.release)
    }

    pub fn blocks_received(&self) -> u16 {
        self.reception
            .as_ref()
            .map_or(0, |reception| reception.received.count())
    }

    /// Prepare the inactive slot for the announced release.
    ///
    /// A repeated START for the release already in progress keeps the blocks
    /// received so far.
    pub fn on_start(
        &mut self,
        from: NodeAddr,
        block_count: u16,
        size: u32,
        version: FirmwareVersion,
        running: FirmwareVersion,
        store: &mut ImageStore,
    ) -> Result<()> {
        let release = FirmwareRelease::new(version, size)?;
        if release.block_count != block_count {
            return Err(OtaError::PartitionInvalid(format!(
                "START declares {block_count} blocks for {size} bytes"
            )));
        }
        ensure_not_downgrade(version, running)?;

        let slot_matches = match store.inactive_state() {
            InactiveSlot::Writing { expected_size, .. } => expected_size == size,
            InactiveSlot::Ready(ready) => ready == release,
            InactiveSlot::Invalid => false,
        };
        if slot_matches
            && let Some(reception) = self.reception.as_ref().filter(|r| r.release == release)
        {
            tracing::info!(
                "START from {from} for {version}: continuing with {}/{block_count} blocks",
                reception.received.count()
            );
            return Ok(());
        }

        if store.ready_release() == Some(release) {
            tracing::info!("START from {from} for {version}: image already staged");
            let mut received = BlockSet::new(block_count);
            for index in 0..block_count {
                received.insert(index);
            }
            self.reception = Some(Reception {
                release,
                received,
                complete: true,
            });
            return Ok(());
        }

        if let Some(previous) = self.reception.take() {
            tracing::info!(
                "Discarding partial image {} for new release {version}",
                previous.release.version
            );
        }
        store.begin(size)?;
        tracing::info!("Receiving firmware {version} from {from}: {size} bytes in {block_count} blocks");
        self.reception = Some(Reception {
            release,
            received: BlockSet::new(block_count),
            complete: false,
        });
        Ok(())
    }

    /// Store a block and produce its ACK. Invalid blocks are dropped so the
    /// root retries them.
    pub fn on_block(
        &mut self,
        from: NodeAddr,
        index: u16,
        crc32: u32,
        data: &[u8],
        store: &mut ImageStore,
    ) -> Option<Outbound> {
        let Some(reception) = self.reception.as_mut() else {
            tracing::debug!("BLOCK {index} from {from} without a START, dropping");
            return None;
        };
        let release = reception.release;

        if index >= release.block_count {
            tracing::warn!("BLOCK {index} out of range (block count {})", release.block_count);
            return None;
        }
        let expected_len = release.block_len(index) as usize;
        if data.len() != expected_len {
            tracing::warn!(
                "BLOCK {index} has {} bytes, expected {expected_len}",
                data.len()
            );
            return None;
        }
        let actual = crc32fast::hash(data);
        if actual != crc32 {
            let err = OtaError::ChecksumMismatch {
                index,
                expected: crc32,
                actual,
            };
            tracing::warn!("Dropping block from {from}: {err}");
            return None;
        }

        if !reception.complete && !reception.received.contains(index) {
            if let Err(e) = store.write_at(u32::from(index) * BLOCK_SIZE, data) {
                tracing::warn!("Failed to write block {index}: {e}");
                return None;
            }
            reception.received.insert(index);

            if reception.received.is_full() {
                match store.finalize() {
                    Ok(_) => reception.complete = true,
                    Err(e) => {
                        tracing::error!("Received image for {} is invalid: {e}", release.version);
                        self.reception = None;
                        return None;
                    }
                }
            }
        }

        tracing::debug!("ACK block {index} to {from}");
        Some(Outbound::new(from, OtaMessage::Ack { index }))
    }

    /// Answer a STATUS query and ask for the advertised release if it is newer
    /// than what runs here and not already held.
    pub fn on_status(
        &self,
        from: NodeAddr,
        available: Option<FirmwareVersion>,
        running: FirmwareVersion,
        store: &ImageStore,
    ) -> Vec<Outbound> {
        let staged = store.ready_release().map(|release| release.version);
        let mut out = vec![Outbound::new(
            from,
            OtaMessage::StatusReport { running, staged },
        )];

        if let Some(version) = available {
            let held = staged == Some(version) || self.release().is_some_and(|r| r.version == version);
            if is_downgrade(running, version) && !held {
                tracing::info!("Root offers firmware {version}, requesting it");
                out.push(Outbound::new(from, OtaMessage::Request { version: running }));
            }
        }

        out
    }
}
