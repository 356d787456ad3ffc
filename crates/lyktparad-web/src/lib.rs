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

//! HTTP control surface of the root node

mod ota_api;

pub use ota_api::{ApiResponse, DownloadRequest, OtaApiState, RebootRequest};

use axum::{
    Json, Router,
    routing::{get, post},
};
use lyktparad_ota::OtaCommandSender;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Every OTA route, bound to the given runtime handle
pub fn router(handle: OtaCommandSender) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/ota/download", post(ota_api::download_handler))
        .route("/api/ota/status", get(ota_api::download_status_handler))
        .route("/api/ota/cancel", post(ota_api::cancel_download_handler))
        .route("/api/ota/distribute", post(ota_api::distribute_handler))
        .route(
            "/api/ota/distribution/status",
            get(ota_api::distribution_status_handler),
        )
        .route(
            "/api/ota/distribution/cancel",
            post(ota_api::cancel_distribution_handler),
        )
        .route("/api/ota/reboot", post(ota_api::reboot_handler))
        .route("/api/ota/reboot/status", get(ota_api::reboot_status_handler))
        .route("/api/ota/version", get(ota_api::version_handler))
        .layer(CorsLayer::permissive())
        .with_state(OtaApiState::new(handle))
}

/// Serve the OTA API until the listener fails.
///
/// # Errors
/// Returns error if server fails to bind or serve
pub async fn start_web_server(
    handle: OtaCommandSender,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(handle);

    let addr = format!("0.0.0.0:{port}");
    info!("Starting OTA web server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use lyktparad_ota::distribution::DistributionStatus;
    use lyktparad_ota::{FirmwareVersion, NodeRole, OtaCommand, OtaError, Slot, VersionInfo};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Runtime stand-in answering every command with canned data
    fn fake_runtime() -> OtaCommandSender {
        let (sender, mut channel) = OtaCommandSender::new();
        tokio::spawn(async move {
            while let Some(command) = channel.recv().await {
                match command {
                    OtaCommand::StartDownload { url, version, reply } => {
                        let result = if url.starts_with("http") {
                            Ok(())
                        } else {
                            Err(OtaError::InvalidUrl(url))
                        };
                        assert_eq!(version, Some(FirmwareVersion::new(1, 2, 0)));
                        let _ = reply.send(result);
                    }
                    OtaCommand::StartDistribution { reply } => {
                        let _ = reply.send(Err(OtaError::NoReleaseStaged));
                    }
                    OtaCommand::DistributionStatus { reply } => {
                        let _ = reply.send(DistributionStatus {
                            distributing: true,
                            total_blocks: 150,
                            current_block: 80,
                            overall_progress: 0.5,
                            nodes_total: 3,
                            nodes_complete: 0,
                            nodes_failed: 1,
                        });
                    }
                    OtaCommand::StartReboot {
                        timeout_secs,
                        delay_ms,
                        reply,
                    } => {
                        let result = if timeout_secs == Some(20) || timeout_secs.is_none() {
                            Ok(())
                        } else {
                            Err(OtaError::RejectedIncompleteDistribution {
                                nodes_total: 3,
                                nodes_complete: 2,
                                nodes_failed: 1,
                            })
                        };
                        assert!(delay_ms.is_none() || delay_ms == Some(500));
                        let _ = reply.send(result);
                    }
                    OtaCommand::Version { reply } => {
                        let _ = reply.send(VersionInfo {
                            version: FirmwareVersion::new(1, 1, 0),
                            role: NodeRole::Root,
                            running_slot: Slot::A,
                            staged: None,
                            rollback_pending: false,
                        });
                    }
                    // Everything else is dropped unanswered
                    OtaCommand::DownloadStatus { .. }
                    | OtaCommand::CancelDownload { .. }
                    | OtaCommand::CancelDistribution { .. }
                    | OtaCommand::RebootStatus { .. } => {}
                }
            }
        });
        sender
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(router(fake_runtime()), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_download_accepted_and_rejected() {
        let app = router(fake_runtime());
        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/ota/download",
            Some(json!({"url": "http://fw.local/1.2.0.bin", "version": "1.2.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let (status, body) = call(
            app,
            "POST",
            "/api/ota/download",
            Some(json!({"url": "fw.bin", "version": "v1.2.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("fw.bin"));
    }

    #[tokio::test]
    async fn test_download_with_malformed_version() {
        let (status, body) = call(
            router(fake_runtime()),
            "POST",
            "/api/ota/download",
            Some(json!({"url": "http://fw.local/x.bin", "version": "one.two"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_download_with_unusable_body() {
        let app = router(fake_runtime());
        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/ota/download",
            Some(json!({"version": "1.2.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("invalid request body"));

        let (status, body) = call(app, "POST", "/api/ota/download", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_distribution_endpoints() {
        let app = router(fake_runtime());
        let (_, body) = call(app.clone(), "POST", "/api/ota/distribute", None).await;
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].is_string());

        let (status, body) = call(app, "GET", "/api/ota/distribution/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["distributing"], json!(true));
        assert_eq!(body["total_blocks"], json!(150));
        assert_eq!(body["current_block"], json!(80));
        assert_eq!(body["nodes_failed"], json!(1));
    }

    #[tokio::test]
    async fn test_reboot_body_is_optional() {
        let app = router(fake_runtime());
        let (_, body) = call(app.clone(), "POST", "/api/ota/reboot", None).await;
        assert_eq!(body, json!({"success": true}));

        let (_, body) = call(
            app.clone(),
            "POST",
            "/api/ota/reboot",
            Some(json!({"timeout": 20, "delay": 500})),
        )
        .await;
        assert_eq!(body, json!({"success": true}));

        let (status, body) = call(app, "POST", "/api/ota/reboot", Some(json!({"timeout": 5}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("2/3"));
    }

    #[tokio::test]
    async fn test_version() {
        let (_, body) = call(router(fake_runtime()), "GET", "/api/ota/version", None).await;
        assert_eq!(body["version"], json!("1.1.0"));
        assert_eq!(body["role"], json!("root"));
    }

    #[tokio::test]
    async fn test_unanswered_query_reports_failure() {
        let (status, body) = call(router(fake_runtime()), "GET", "/api/ota/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
    }
}
