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

//! Image Store: exclusive owner of the two firmware slots of a node
//!
//! Writes only ever go to the inactive slot. The slot moves through
//! `Invalid -> Writing -> Ready` and drops back to `Invalid` on any failure or
//! discard; only a `Ready` slot may be distributed or selected for boot.

pub mod header;
pub mod partitions;

pub use header::{HEADER_LEN, ImageHeader, build_image, validate_image};
pub use partitions::{FilePartitions, FlashPartitions, MemoryPartitions, Slot};

use crate::error::{OtaError, Result};
use crate::version::FirmwareVersion;
use bytes::Bytes;
use serde::Serialize;

/// Fixed fragment size used for streaming writes and mesh distribution
pub const BLOCK_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareRelease {
    pub version: FirmwareVersion,
    pub size: u32,
    pub block_count: u16,
}

impl FirmwareRelease {
    pub fn new(version: FirmwareVersion, size: u32) -> Result<Self> {
        let block_count = u16::try_from(size.div_ceil(BLOCK_SIZE)).map_err(|_| {
            OtaError::PartitionInvalid(format!("image of {size} bytes needs too many blocks"))
        })?;
        Ok(Self {
            version,
            size,
            block_count,
        })
    }

    /// Byte length of block `index`; the last block may be short.
    pub fn block_len(&self, index: u16) -> u32 {
        let start = u32::from(index) * BLOCK_SIZE;
        self.size.saturating_sub(start).min(BLOCK_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactiveSlot {
    Invalid,
    Writing { expected_size: u32, written: u32 },
    Ready(FirmwareRelease),
}

#[derive(Debug)]
pub struct ImageStore {
    partitions: Box<dyn FlashPartitions>,
    inactive: InactiveSlot,
}

impl ImageStore {
    pub fn new(partitions: Box<dyn FlashPartitions>) -> Self {
        tracing::debug!(
            "Image store opened: running slot {}, boot slot {}",
            partitions.running_slot(),
            partitions.boot_slot()
        );
        Self {
            partitions,
            inactive: InactiveSlot::Invalid,
        }
    }

    pub fn running_slot(&self) -> Slot {
        self.partitions.running_slot()
    }

    pub fn inactive_slot(&self) -> Slot {
        self.partitions.running_slot().other()
    }

    pub fn boot_slot(&self) -> Slot {
        self.partitions.boot_slot()
    }

    pub fn inactive_state(&self) -> InactiveSlot {
        self.inactive
    }

    /// Version recorded in the header of the running image, if it has one.
    pub fn running_version(&self) -> Option<FirmwareVersion> {
        let raw = self
            .partitions
            .read(self.running_slot(), 0, HEADER_LEN as u32)
            .ok()?;
        ImageHeader::parse(&raw).ok().map(|header| header.version)
    }

    /// Erase the inactive slot and prepare it for an image of `size` bytes.
    pub fn begin(&mut self, size: u32) -> Result<()> {
        if size > self.partitions.capacity() {
            self.inactive = InactiveSlot::Invalid;
            return Err(OtaError::FlashFull(format!(
                "image of {size} bytes exceeds slot capacity {}",
                self.partitions.capacity()
            )));
        }
        if (size as usize) < HEADER_LEN {
            self.inactive = InactiveSlot::Invalid;
            return Err(OtaError::PartitionInvalid(format!(
                "image of {size} bytes is smaller than its header"
            )));
        }

        let slot = self.inactive_slot();
        self.partitions.erase(slot)?;
        self.inactive = InactiveSlot::Writing {
            expected_size: size,
            written: 0,
        };
        tracing::debug!("Slot {slot} erased for a {size} byte image");
        Ok(())
    }

    /// Append sequential bytes after everything written so far.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let InactiveSlot::Writing { written, .. } = self.inactive else {
            return Err(OtaError::PartitionInvalid("inactive slot is not being written".to_owned()));
        };
        self.write_at(written, data)
    }

    pub fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let InactiveSlot::Writing {
            expected_size,
            written,
        } = self.inactive
        else {
            return Err(OtaError::PartitionInvalid("inactive slot is not being written".to_owned()));
        };

        let len = u32::try_from(data.len())
            .map_err(|_| OtaError::PartitionInvalid("write too large".to_owned()))?;
        let end = offset.saturating_add(len);
        if end > expected_size {
            return Err(OtaError::PartitionInvalid(format!(
                "write of {len} bytes at {offset} overruns the {expected_size} byte image"
            )));
        }

        let slot = self.inactive_slot();
        if let Err(e) = self.partitions.write(slot, offset, data) {
            self.inactive = InactiveSlot::Invalid;
            return Err(e);
        }
        self.inactive = InactiveSlot::Writing {
            expected_size,
            written: written.max(end),
        };
        Ok(())
    }

    pub fn bytes_written(&self) -> u32 {
        match self.inactive {
            InactiveSlot::Writing { written, .. } => written,
            InactiveSlot::Ready(release) => release.size,
            InactiveSlot::Invalid => 0,
        }
    }

    /// Validate the freshly written image and mark the slot ready.
    pub fn finalize(&mut self) -> Result<FirmwareRelease> {
        let InactiveSlot::Writing {
            expected_size,
            written,
        } = self.inactive
        else {
            return Err(OtaError::PartitionInvalid("inactive slot is not being written".to_owned()));
        };

        if written != expected_size {
            self.inactive = InactiveSlot::Invalid;
            return Err(OtaError::PartitionInvalid(format!(
                "incomplete image: {written} of {expected_size} bytes written"
            )));
        }

        match self.check_slot(expected_size) {
            Ok(release) => {
                self.inactive = InactiveSlot::Ready(release);
                tracing::info!(
                    "Slot {} holds a valid {} byte image of version {}",
                    self.inactive_slot(),
                    release.size,
                    release.version
                );
                Ok(release)
            }
            Err(e) => {
                self.inactive = InactiveSlot::Invalid;
                Err(e)
            }
        }
    }

    /// Re-read and re-validate the ready image, e.g. before committing to it.
    pub fn validate_inactive(&mut self) -> Result<FirmwareRelease> {
        let InactiveSlot::Ready(release) = self.inactive else {
            return Err(OtaError::NoReleaseStaged);
        };

        match self.check_slot(release.size) {
            Ok(checked) if checked == release => Ok(release),
            Ok(_) => {
                self.inactive = InactiveSlot::Invalid;
                Err(OtaError::PartitionInvalid("inactive image changed on flash".to_owned()))
            }
            Err(e) => {
                self.inactive = InactiveSlot::Invalid;
                Err(e)
            }
        }
    }

    fn check_slot(&self, size: u32) -> Result<FirmwareRelease> {
        let image = self.partitions.read(self.inactive_slot(), 0, size)?;
        let header = validate_image(&image)?;
        FirmwareRelease::new(header.version, size)
    }

    /// Drop whatever is in the inactive slot; it stays unusable until rewritten.
    pub fn invalidate(&mut self) -> Result<()> {
        self.inactive = InactiveSlot::Invalid;
        let slot = self.inactive_slot();
        self.partitions.erase(slot)
    }

    pub fn ready_release(&self) -> Option<FirmwareRelease> {
        match self.inactive {
            InactiveSlot::Ready(release) => Some(release),
            InactiveSlot::Invalid | InactiveSlot::Writing { .. } => None,
        }
    }

    /// Full contents of the ready image.
    pub fn read_image(&self) -> Result<Bytes> {
        let release = self.ready_release().ok_or(OtaError::NoReleaseStaged)?;
        let image = self.partitions.read(self.inactive_slot(), 0, release.size)?;
        Ok(Bytes::from(image))
    }

    /// Select the inactive slot for the next boot. Requires a ready image.
    pub fn boot_inactive(&mut self) -> Result<Slot> {
        if self.ready_release().is_none() {
            return Err(OtaError::NoReleaseStaged);
        }
        let slot = self.inactive_slot();
        self.partitions.set_boot_slot(slot)?;
        Ok(slot)
    }

    /// Keep booting the running slot.
    pub fn boot_running(&mut self) -> Result<Slot> {
        let slot = self.running_slot();
        self.partitions.set_boot_slot(slot)?;
        Ok(slot)
    }

    /// Select the running slot's counterpart for the next boot without any
    /// validity requirement. Used to revert to the previous firmware.
    pub fn boot_other(&mut self) -> Result<Slot> {
        let slot = self.inactive_slot();
        self.partitions.set_boot_slot(slot)?;
        Ok(slot)
    }
}
