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

use axum::{Json, body::Bytes, extract::State, response::IntoResponse};
use lyktparad_ota::{FirmwareVersion, OtaCommandSender, OtaError, parse_version};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Shared state for OTA endpoints
#[derive(Clone, Debug)]
pub struct OtaApiState {
    pub handle: OtaCommandSender,
}

impl OtaApiState {
    pub fn new(handle: OtaCommandSender) -> Self {
        Self { handle }
    }
}

/// Body of every command endpoint and of failed queries
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<(), OtaError>> for ApiResponse {
    fn from(result: Result<(), OtaError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => {
                warn!("OTA request rejected: {e}");
                Self::failed(e)
            }
        }
    }
}

/// Query results are the runtime's status, a failed query is an [`ApiResponse`]
fn query<T: Serialize>(result: Result<T, OtaError>) -> impl IntoResponse {
    result.map(Json).map_err(|e| Json(ApiResponse::failed(e)))
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    /// Release version the caller expects, checked before anything is fetched
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RebootRequest {
    /// Seconds to wait for every node to report ready
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Milliseconds between REBOOT and the restart
    #[serde(default)]
    pub delay: Option<u32>,
}

/// POST /api/ota/download
pub async fn download_handler(State(state): State<OtaApiState>, body: Bytes) -> Json<ApiResponse> {
    let request = match serde_json::from_slice::<DownloadRequest>(&body) {
        Ok(request) => request,
        Err(e) => return Json(ApiResponse::failed(format!("invalid request body: {e}"))),
    };
    let version: Option<FirmwareVersion> = match request.version.as_deref().map(parse_version) {
        Some(Ok(version)) => Some(version),
        Some(Err(e)) => return Json(ApiResponse::failed(e)),
        None => None,
    };
    info!("Firmware download requested from {}", request.url);
    Json(state.handle.start_download(request.url, version).await.into())
}

/// GET /api/ota/status
pub async fn download_status_handler(State(state): State<OtaApiState>) -> impl IntoResponse {
    query(state.handle.download_status().await)
}

/// POST /api/ota/cancel
pub async fn cancel_download_handler(State(state): State<OtaApiState>) -> Json<ApiResponse> {
    Json(state.handle.cancel_download().await.into())
}

/// POST /api/ota/distribute
pub async fn distribute_handler(State(state): State<OtaApiState>) -> Json<ApiResponse> {
    info!("Firmware distribution requested");
    Json(state.handle.start_distribution().await.into())
}

/// GET /api/ota/distribution/status
pub async fn distribution_status_handler(State(state): State<OtaApiState>) -> impl IntoResponse {
    query(state.handle.distribution_status().await)
}

/// POST /api/ota/distribution/cancel
pub async fn cancel_distribution_handler(State(state): State<OtaApiState>) -> Json<ApiResponse> {
    Json(state.handle.cancel_distribution().await.into())
}

/// POST /api/ota/reboot
///
/// The body is optional; a missing body or missing fields use the node's
/// configured defaults.
pub async fn reboot_handler(State(state): State<OtaApiState>, body: Bytes) -> Json<ApiResponse> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RebootRequest::default()
    } else {
        match serde_json::from_slice::<RebootRequest>(&body) {
            Ok(request) => request,
            Err(e) => return Json(ApiResponse::failed(format!("invalid request body: {e}"))),
        }
    };
    info!(
        "Coordinated reboot requested (timeout {:?}s, delay {:?}ms)",
        request.timeout, request.delay
    );
    Json(
        state
            .handle
            .start_reboot(request.timeout, request.delay)
            .await
            .into(),
    )
}

/// GET /api/ota/reboot/status
pub async fn reboot_status_handler(State(state): State<OtaApiState>) -> impl IntoResponse {
    query(state.handle.reboot_status().await)
}

/// GET /api/ota/version
pub async fn version_handler(State(state): State<OtaApiState>) -> impl IntoResponse {
    query(state.handle.version().await)
}
