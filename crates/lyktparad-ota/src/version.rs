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

//! Firmware version parsing, comparison and downgrade gatekeeping
//!
//! Every rollout checkpoint (download, distribution, reboot, rollback commit)
//! calls [`ensure_not_downgrade`] before it mutates any state.

use crate::error::{OtaError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Semantic firmware version, ordered lexicographically on (major, minor, patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FirmwareVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self> {
        parse_version(s)
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = OtaError;

    fn try_from(value: String) -> Result<Self> {
        parse_version(&value)
    }
}

impl From<FirmwareVersion> for String {
    fn from(version: FirmwareVersion) -> Self {
        version.to_string()
    }
}

/// Parse semver-like version strings (e.g., "1.0.0", "v1.2.3")
pub fn parse_version(s: &str) -> Result<FirmwareVersion> {
    let trimmed = s.trim().trim_start_matches(['v', 'V']);
    let parts: Vec<&str> = trimmed.split('.').collect();

    let [major, minor, patch] = parts.as_slice() else {
        return Err(OtaError::VersionParse(format!(
            "Invalid version format: {s}, expected MAJOR.MINOR.PATCH"
        )));
    };

    let component = |name: &str, raw: &str| {
        raw.parse::<u16>()
            .map_err(|_| OtaError::VersionParse(format!("Invalid {name} version: {raw}")))
    };

    Ok(FirmwareVersion::new(
        component("major", major)?,
        component("minor", minor)?,
        component("patch", patch)?,
    ))
}

pub fn compare(a: FirmwareVersion, b: FirmwareVersion) -> Ordering {
    a.cmp(&b)
}

/// True when `candidate` is strictly older than `current`. Equal versions are a re-install.
pub fn is_downgrade(candidate: FirmwareVersion, current: FirmwareVersion) -> bool {
    compare(candidate, current) == Ordering::Less
}

pub fn ensure_not_downgrade(candidate: FirmwareVersion, current: FirmwareVersion) -> Result<()> {
    if is_downgrade(candidate, current) {
        return Err(OtaError::RejectedDowngrade { candidate, current });
    }
    Ok(())
}
