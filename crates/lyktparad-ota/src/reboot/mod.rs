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

//! Two-phase fleet reboot: every node prepares, then all switch together or none does

pub mod agent;
pub mod coordinator;

pub use agent::RebootAgent;
pub use coordinator::{
    CoordinatorOutput, NodeReadiness, RebootCoordinator, RebootSession, RebootState, RebootStatus,
};
