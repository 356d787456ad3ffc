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

//! Alternate firmware slots
//!
//! A node has two image areas. The slot selected for boot when the partitions
//! are opened is the running slot; the other one is the only write target.

use crate::error::{OtaError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Raw access to the two firmware slots of one node
pub trait FlashPartitions: Send + std::fmt::Debug {
    /// Slot the node booted from
    fn running_slot(&self) -> Slot;

    /// Size of one slot in bytes
    fn capacity(&self) -> u32;

    fn erase(&mut self, slot: Slot) -> Result<()>;

    fn write(&mut self, slot: Slot, offset: u32, data: &[u8]) -> Result<()>;

    fn read(&self, slot: Slot, offset: u32, len: u32) -> Result<Vec<u8>>;

    /// Slot the bootloader will start next time
    fn boot_slot(&self) -> Slot;

    fn set_boot_slot(&mut self, slot: Slot) -> Result<()>;
}

fn check_bounds(capacity: u32, offset: u32, len: usize) -> Result<u32> {
    let len = u32::try_from(len).map_err(|_| OtaError::Transport("write too large".to_owned()))?;
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(end),
        _ => Err(OtaError::FlashFull(format!(
            "{len} bytes at offset {offset} exceed slot capacity {capacity}"
        ))),
    }
}

#[derive(Debug)]
struct MemoryFlash {
    slots: [Vec<u8>; 2],
    boot: Slot,
}

/// RAM-backed partitions. Clones share the same flash, which lets a test
/// "reboot" a node with [`MemoryPartitions::reopen`].
#[derive(Debug, Clone)]
pub struct MemoryPartitions {
    flash: Arc<Mutex<MemoryFlash>>,
    running: Slot,
    capacity: u32,
}

impl MemoryPartitions {
    pub fn new(capacity: u32) -> Self {
        Self {
            flash: Arc::new(Mutex::new(MemoryFlash {
                slots: [Vec::new(), Vec::new()],
                boot: Slot::A,
            })),
            running: Slot::A,
            capacity,
        }
    }

    /// Partitions with `image` flashed into slot A, as shipped from the factory.
    pub fn with_running_image(capacity: u32, image: &[u8]) -> Result<Self> {
        let mut partitions = Self::new(capacity);
        partitions.write(Slot::A, 0, image)?;
        Ok(partitions)
    }

    /// Same flash, running from whatever slot is selected for boot.
    pub fn reopen(&self) -> Self {
        let boot = self.flash.lock().boot;
        Self {
            flash: Arc::clone(&self.flash),
            running: boot,
            capacity: self.capacity,
        }
    }
}

impl FlashPartitions for MemoryPartitions {
    fn running_slot(&self) -> Slot {
        self.running
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn erase(&mut self, slot: Slot) -> Result<()> {
        let mut flash = self.flash.lock();
        if let Some(area) = flash.slots.get_mut(slot.index()) {
            area.clear();
        }
        Ok(())
    }

    fn write(&mut self, slot: Slot, offset: u32, data: &[u8]) -> Result<()> {
        let end = check_bounds(self.capacity, offset, data.len())? as usize;
        let start = offset as usize;
        let mut flash = self.flash.lock();
        let area = flash
            .slots
            .get_mut(slot.index())
            .ok_or_else(|| OtaError::Transport(format!("no slot {slot}")))?;
        if area.len() < end {
            area.resize(end, 0xFF);
        }
        if let Some(target) = area.get_mut(start..end) {
            target.copy_from_slice(data);
        }
        Ok(())
    }

    fn read(&self, slot: Slot, offset: u32, len: u32) -> Result<Vec<u8>> {
        let flash = self.flash.lock();
        let start = offset as usize;
        let end = start + len as usize;
        flash
            .slots
            .get(slot.index())
            .and_then(|area| area.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                OtaError::Transport(format!("read past end of slot {slot} ({len} bytes at {offset})"))
            })
    }

    fn boot_slot(&self) -> Slot {
        self.flash.lock().boot
    }

    fn set_boot_slot(&mut self, slot: Slot) -> Result<()> {
        self.flash.lock().boot = slot;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct OtaData {
    boot_slot: Slot,
}

/// Partitions stored as `slot_a.bin`, `slot_b.bin` and an `otadata.json`
/// boot-selection record inside one directory.
#[derive(Debug)]
pub struct FilePartitions {
    dir: PathBuf,
    running: Slot,
    boot: Slot,
    capacity: u32,
}

impl FilePartitions {
    pub fn open(dir: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let otadata_path = dir.join("otadata.json");
        let boot = if otadata_path.exists() {
            let content = fs::read_to_string(&otadata_path)?;
            let otadata: OtaData = serde_json::from_str(&content)
                .map_err(|e| OtaError::State(format!("Failed to parse otadata: {e}")))?;
            otadata.boot_slot
        } else {
            Slot::A
        };

        for slot in [Slot::A, Slot::B] {
            let path = slot_path(&dir, slot);
            if !path.exists() {
                File::create(&path)?;
            }
        }

        tracing::debug!("Opened partitions in {}, running slot {boot}", dir.display());

        Ok(Self {
            dir,
            running: boot,
            boot,
            capacity,
        })
    }

    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        slot_path(&self.dir, slot)
    }
}

fn slot_path(dir: &Path, slot: Slot) -> PathBuf {
    match slot {
        Slot::A => dir.join("slot_a.bin"),
        Slot::B => dir.join("slot_b.bin"),
    }
}

impl FlashPartitions for FilePartitions {
    fn running_slot(&self) -> Slot {
        self.running
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn erase(&mut self, slot: Slot) -> Result<()> {
        File::create(self.slot_path(slot))?;
        Ok(())
    }

    fn write(&mut self, slot: Slot, offset: u32, data: &[u8]) -> Result<()> {
        check_bounds(self.capacity, offset, data.len())?;
        let mut file = OpenOptions::new().write(true).open(self.slot_path(slot))?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read(&self, slot: Slot, offset: u32, len: u32) -> Result<Vec<u8>> {
        let mut file = File::open(self.slot_path(slot))?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn boot_slot(&self) -> Slot {
        self.boot
    }

    fn set_boot_slot(&mut self, slot: Slot) -> Result<()> {
        let path = self.dir.join("otadata.json");
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&OtaData { boot_slot: slot })?;

        // Atomic write
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;

        self.boot = slot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_write_read_and_capacity() {
        let mut partitions = MemoryPartitions::new(16);
        partitions.write(Slot::B, 4, b"abcd").unwrap();
        assert_eq!(partitions.read(Slot::B, 4, 4).unwrap(), b"abcd");
        assert_eq!(partitions.read(Slot::B, 0, 4).unwrap(), vec![0xFF; 4]);

        let err = partitions.write(Slot::B, 14, b"xyz").unwrap_err();
        assert!(err.to_string().contains("flash full"));

        partitions.erase(Slot::B).unwrap();
        assert!(partitions.read(Slot::B, 0, 1).is_err());
    }

    #[test]
    fn test_memory_reopen_boots_selected_slot() {
        let mut partitions = MemoryPartitions::new(64);
        assert_eq!(partitions.running_slot(), Slot::A);
        partitions.write(Slot::B, 0, b"new").unwrap();
        partitions.set_boot_slot(Slot::B).unwrap();

        // Still running A until the "reboot"
        assert_eq!(partitions.running_slot(), Slot::A);

        let rebooted = partitions.reopen();
        assert_eq!(rebooted.running_slot(), Slot::B);
        assert_eq!(rebooted.read(Slot::B, 0, 3).unwrap(), b"new");
    }

    #[test]
    fn test_file_partitions_persist_boot_selection() {
        let dir = TempDir::new().unwrap();

        let mut partitions = FilePartitions::open(dir.path(), 1024).unwrap();
        assert_eq!(partitions.running_slot(), Slot::A);
        partitions.write(Slot::B, 0, b"firmware").unwrap();
        partitions.set_boot_slot(Slot::B).unwrap();
        assert!(dir.path().join("otadata.json").exists());
        assert!(!dir.path().join("otadata.tmp").exists());

        let reopened = FilePartitions::open(dir.path(), 1024).unwrap();
        assert_eq!(reopened.running_slot(), Slot::B);
        assert_eq!(reopened.read(Slot::B, 0, 8).unwrap(), b"firmware");
    }

    #[test]
    fn test_file_erase_truncates() {
        let dir = TempDir::new().unwrap();
        let mut partitions = FilePartitions::open(dir.path(), 1024).unwrap();
        partitions.write(Slot::A, 0, b"old image").unwrap();
        partitions.erase(Slot::A).unwrap();
        assert!(partitions.read(Slot::A, 0, 1).is_err());
        assert!(partitions.write(Slot::A, 1020, b"too long").is_err());
    }
}
