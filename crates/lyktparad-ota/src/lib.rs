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

//! Lyktparad OTA - firmware rollout for a self-organizing mesh of light nodes
//!
//! The root node fetches a firmware image over HTTP into its inactive slot,
//! replicates it block by block to every peer, then switches the whole fleet
//! to it in one coordinated reboot. Nodes that cannot rejoin the mesh after
//! the switch roll back on their own.

pub mod bridge;
pub mod config;
pub mod distribution;
pub mod download;
pub mod error;
pub mod image;
pub mod mesh;
pub mod node;
pub mod reboot;
pub mod rollback;
pub mod state;
pub mod version;
pub mod wire;

pub use bridge::{OtaCommand, OtaCommandChannel, OtaCommandSender, VersionInfo};
pub use config::OtaConfig;
pub use distribution::{DistributionOrchestrator, DistributionState, DistributionStatus};
pub use download::{DownloadManager, DownloadState, DownloadStatus};
pub use error::{OtaError, Result};
pub use image::{FilePartitions, FirmwareRelease, FlashPartitions, ImageStore, MemoryPartitions, Slot};
pub use mesh::{MeshEvent, MeshTransport, NodeAddr, NodeRole, Outbound};
pub use node::{NodeExit, OtaNode};
pub use reboot::{RebootCoordinator, RebootState, RebootStatus};
pub use state::{JsonStateStore, MemoryStateStore, PersistentOtaState, StateStore};
pub use version::{FirmwareVersion, parse_version};
pub use wire::OtaMessage;
