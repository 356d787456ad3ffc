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

//! Reliable replication of a staged image from the root to every mesh peer

pub mod agent;
pub mod blockset;
pub mod orchestrator;

pub use agent::DistributionAgent;
pub use blockset::BlockSet;
pub use orchestrator::{
    DistributionOrchestrator, DistributionSession, DistributionState, DistributionStatus,
    NodeProgress,
};
