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

//! Error types for the rollout engine

use crate::version::FirmwareVersion;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("rejected downgrade: {candidate} is older than {current}")]
    RejectedDowngrade {
        candidate: FirmwareVersion,
        current: FirmwareVersion,
    },

    #[error("rejected: a {0} session is already active")]
    RejectedBusy(&'static str),

    #[error(
        "rejected: distribution incomplete ({nodes_complete}/{nodes_total} nodes complete, {nodes_failed} failed)"
    )]
    RejectedIncompleteDistribution {
        nodes_total: usize,
        nodes_complete: usize,
        nodes_failed: usize,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("flash full: {0}")]
    FlashFull(String),

    #[error("checksum mismatch on block {index}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        index: u16,
        expected: u32,
        actual: u32,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("partition invalid: {0}")]
    PartitionInvalid(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("download failed with HTTP status {0}")]
    HttpStatus(u16),

    #[error("no firmware release is staged in the inactive slot")]
    NoReleaseStaged,

    #[error("operation is only available on the root node")]
    NotRoot,

    #[error("state persistence error: {0}")]
    State(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("version parse error: {0}")]
    VersionParse(String),

    #[error("node runtime is not running")]
    Unavailable,
}

impl OtaError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }

    /// Short machine-friendly name, used in HTTP error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RejectedDowngrade { .. } => "rejected_downgrade",
            Self::RejectedBusy(_) => "rejected_busy",
            Self::RejectedIncompleteDistribution { .. } => "rejected_incomplete_distribution",
            Self::Transport(_) => "transport_error",
            Self::FlashFull(_) => "flash_full",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Timeout(_) => "timeout",
            Self::PartitionInvalid(_) => "partition_invalid",
            Self::InvalidUrl(_) => "invalid_url",
            Self::HttpStatus(_) => "http_status",
            Self::NoReleaseStaged => "no_release_staged",
            Self::NotRoot => "not_root",
            Self::State(_) => "state_error",
            Self::Config(_) => "config_error",
            Self::VersionParse(_) => "version_parse",
            Self::Unavailable => "unavailable",
        }
    }
}

impl From<std::io::Error> for OtaError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(err: serde_json::Error) -> Self {
        Self::State(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OtaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(OtaError::Transport("connection reset".to_owned()).is_retryable());
        assert!(OtaError::Timeout("read".to_owned()).is_retryable());
        assert!(OtaError::HttpStatus(503).is_retryable());
        assert!(!OtaError::HttpStatus(404).is_retryable());
        assert!(!OtaError::PartitionInvalid("bad magic".to_owned()).is_retryable());
        assert!(!OtaError::FlashFull("slot capacity 4096".to_owned()).is_retryable());
        assert!(
            !OtaError::RejectedDowngrade {
                candidate: FirmwareVersion::new(1, 0, 0),
                current: FirmwareVersion::new(1, 1, 0),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_downgrade_message() {
        let err = OtaError::RejectedDowngrade {
            candidate: FirmwareVersion::new(0, 9, 1),
            current: FirmwareVersion::new(1, 0, 0),
        };
        assert_eq!(err.to_string(), "rejected downgrade: 0.9.1 is older than 1.0.0");
        assert_eq!(err.kind(), "rejected_downgrade");
    }
}
