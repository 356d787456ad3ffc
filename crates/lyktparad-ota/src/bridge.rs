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

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::distribution::DistributionStatus;
use crate::download::DownloadStatus;
use crate::error::{OtaError, Result};
use crate::image::Slot;
use crate::mesh::NodeRole;
use crate::reboot::RebootStatus;
use crate::version::FirmwareVersion;

type Reply<T> = oneshot::Sender<T>;

/// Control request from async handlers to the node runtime
#[derive(Debug)]
pub enum OtaCommand {
    StartDownload {
        url: String,
        version: Option<FirmwareVersion>,
        reply: Reply<Result<()>>,
    },
    DownloadStatus {
        reply: Reply<DownloadStatus>,
    },
    CancelDownload {
        reply: Reply<Result<()>>,
    },
    StartDistribution {
        reply: Reply<Result<()>>,
    },
    DistributionStatus {
        reply: Reply<DistributionStatus>,
    },
    CancelDistribution {
        reply: Reply<Result<()>>,
    },
    StartReboot {
        timeout_secs: Option<u64>,
        delay_ms: Option<u32>,
        reply: Reply<Result<()>>,
    },
    RebootStatus {
        reply: Reply<RebootStatus>,
    },
    Version {
        reply: Reply<VersionInfo>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: FirmwareVersion,
    pub role: NodeRole,
    pub running_slot: Slot,
    pub staged: Option<FirmwareVersion>,
    pub rollback_pending: bool,
}

/// Receiving end, owned by the node runtime
#[derive(Debug)]
pub struct OtaCommandChannel {
    receiver: mpsc::UnboundedReceiver<OtaCommand>,
}

impl OtaCommandChannel {
    pub async fn recv(&mut self) -> Option<OtaCommand> {
        self.receiver.recv().await
    }
}

/// Clonable handle for issuing commands to the node runtime
#[derive(Clone)]
pub struct OtaCommandSender {
    sender: mpsc::UnboundedSender<OtaCommand>,
}

impl std::fmt::Debug for OtaCommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaCommandSender").finish_non_exhaustive()
    }
}

impl OtaCommandSender {
    /// Create a new sender/receiver pair
    pub fn new() -> (Self, OtaCommandChannel) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, OtaCommandChannel { receiver })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> OtaCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .map_err(|_| OtaError::Unavailable)?;
        response.await.map_err(|_| OtaError::Unavailable)
    }

    pub async fn start_download(&self, url: String, version: Option<FirmwareVersion>) -> Result<()> {
        self.request(|reply| OtaCommand::StartDownload {
            url,
            version,
            reply,
        })
        .await?
    }

    pub async fn download_status(&self) -> Result<DownloadStatus> {
        self.request(|reply| OtaCommand::DownloadStatus { reply })
            .await
    }

    pub async fn cancel_download(&self) -> Result<()> {
        self.request(|reply| OtaCommand::CancelDownload { reply })
            .await?
    }

    pub async fn start_distribution(&self) -> Result<()> {
        self.request(|reply| OtaCommand::StartDistribution { reply })
            .await?
    }

    pub async fn distribution_status(&self) -> Result<DistributionStatus> {
        self.request(|reply| OtaCommand::DistributionStatus { reply })
            .await
    }

    pub async fn cancel_distribution(&self) -> Result<()> {
        self.request(|reply| OtaCommand::CancelDistribution { reply })
            .await?
    }

    pub async fn start_reboot(&self, timeout_secs: Option<u64>, delay_ms: Option<u32>) -> Result<()> {
        self.request(|reply| OtaCommand::StartReboot {
            timeout_secs,
            delay_ms,
            reply,
        })
        .await?
    }

    pub async fn reboot_status(&self) -> Result<RebootStatus> {
        self.request(|reply| OtaCommand::RebootStatus { reply })
            .await
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        self.request(|reply| OtaCommand::Version { reply }).await
    }
}
