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

//! Firmware download into the inactive slot (root only)
//!
//! The body is streamed in 1 KiB writes. The image header is inspected before
//! the slot is erased, so a downgrade or a foreign file never touches flash.

use crate::config::DownloadConfig;
use crate::error::{OtaError, Result};
use crate::image::{BLOCK_SIZE, FirmwareRelease, HEADER_LEN, ImageHeader, ImageStore, InactiveSlot, Slot};
use crate::version::{FirmwareVersion, ensure_not_downgrade};
use bytes::BytesMut;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub url: String,
    pub target_slot: Slot,
    pub bytes_written: u64,
    /// Image size from the header, once it has been received
    pub total_bytes: Option<u64>,
    pub state: DownloadState,
    pub version: Option<FirmwareVersion>,
    pub error: Option<OtaError>,
    logged_decile: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadStatus {
    pub downloading: bool,
    pub progress: f64,
    pub state: DownloadState,
    pub bytes_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<FirmwareVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a single attempt ended
enum AttemptError {
    Retry(OtaError),
    Fatal(OtaError),
}

impl AttemptError {
    fn classify(err: OtaError) -> Self {
        if err.is_retryable() {
            Self::Retry(err)
        } else {
            Self::Fatal(err)
        }
    }
}

#[derive(Debug)]
pub struct DownloadManager {
    config: DownloadConfig,
    client: reqwest::Client,
    store: Arc<Mutex<ImageStore>>,
    session: Arc<Mutex<Option<DownloadSession>>>,
    task: Option<JoinHandle<()>>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, store: Arc<Mutex<ImageStore>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lyktparad-ota/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.timeout())
            .read_timeout(config.timeout())
            .build()
            .map_err(|e| OtaError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            store,
            session: Arc::new(Mutex::new(None)),
            task: None,
        })
    }

    pub fn state(&self) -> DownloadState {
        self.session
            .lock()
            .as_ref()
            .map_or(DownloadState::Idle, |session| session.state)
    }

    pub fn is_downloading(&self) -> bool {
        self.state() == DownloadState::InProgress
    }

    /// Start fetching `url` in the background.
    ///
    /// When `expected_version` is given it is checked before anything else;
    /// the version in the image header is always checked before the slot is
    /// erased.
    pub fn start_download(
        &mut self,
        url: &str,
        expected_version: Option<FirmwareVersion>,
        running: FirmwareVersion,
    ) -> Result<()> {
        if let Some(version) = expected_version {
            ensure_not_downgrade(version, running)?;
        }
        if self.is_downloading() {
            return Err(OtaError::RejectedBusy("download"));
        }

        let parsed = reqwest::Url::parse(url).map_err(|e| OtaError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(OtaError::InvalidUrl(format!(
                "{url}: only http and https are supported"
            )));
        }

        let target_slot = self.store.lock().inactive_slot();
        let previous = self.session.lock().replace(DownloadSession {
            url: url.to_owned(),
            target_slot,
            bytes_written: 0,
            total_bytes: None,
            state: DownloadState::InProgress,
            version: expected_version,
            error: None,
            logged_decile: 0,
        });

        tracing::info!("Starting firmware download from {url} into slot {target_slot}");

        let job = DownloadJob {
            config: self.config.clone(),
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            session: Arc::clone(&self.session),
            url: parsed,
            expected_version,
            running,
        };
        self.task = Some(tokio::spawn(job.run(previous)));
        Ok(())
    }

    /// Abort the transfer and discard the partial image.
    pub fn cancel_download(&mut self) -> Result<()> {
        if !self.is_downloading() {
            return Ok(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.session.lock() = None;
        self.store.lock().invalidate()?;
        tracing::info!("Firmware download cancelled");
        Ok(())
    }

    /// Fraction of the image written, 0 when no download is running.
    pub fn get_progress(&self) -> f64 {
        self.session.lock().as_ref().map_or(0.0, progress_of)
    }

    pub fn status(&self) -> DownloadStatus {
        let session = self.session.lock();
        match session.as_ref() {
            Some(session) => DownloadStatus {
                downloading: session.state == DownloadState::InProgress,
                progress: progress_of(session),
                state: session.state,
                bytes_written: session.bytes_written,
                total_bytes: session.total_bytes,
                version: session.version,
                error: session.error.as_ref().map(ToString::to_string),
            },
            None => DownloadStatus {
                downloading: false,
                progress: 0.0,
                state: DownloadState::Idle,
                bytes_written: 0,
                total_bytes: None,
                version: None,
                error: None,
            },
        }
    }
}

fn progress_of(session: &DownloadSession) -> f64 {
    match (session.state, session.total_bytes) {
        (DownloadState::Complete, _) => 1.0,
        (DownloadState::InProgress, Some(total)) if total > 0 => {
            // Images are far below 2^52 bytes
            #[expect(clippy::cast_precision_loss)]
            let fraction = session.bytes_written as f64 / total as f64;
            fraction.min(1.0)
        }
        _ => 0.0,
    }
}

struct DownloadJob {
    config: DownloadConfig,
    client: reqwest::Client,
    store: Arc<Mutex<ImageStore>>,
    session: Arc<Mutex<Option<DownloadSession>>>,
    url: reqwest::Url,
    expected_version: Option<FirmwareVersion>,
    running: FirmwareVersion,
}

impl DownloadJob {
    async fn run(self, previous: Option<DownloadSession>) {
        let max_retries = self.config.max_retries;
        let mut attempt = 0u8;

        let outcome = loop {
            match self.attempt().await {
                Ok(release) => break Ok(release),
                Err(AttemptError::Retry(e)) if attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Download attempt failed: {e}, retrying ({attempt}/{max_retries})"
                    );
                    self.reset_progress();
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(AttemptError::Retry(e) | AttemptError::Fatal(e)) => break Err(e),
            }
        };

        match outcome {
            Ok(release) => {
                if let Some(session) = self.session.lock().as_mut() {
                    session.state = DownloadState::Complete;
                    session.version = Some(release.version);
                    session.bytes_written = u64::from(release.size);
                }
                tracing::info!(
                    "Firmware {} downloaded ({} bytes, {} blocks)",
                    release.version,
                    release.size,
                    release.block_count
                );
            }
            Err(e @ OtaError::RejectedDowngrade { .. }) => {
                tracing::warn!("Download rejected: {e}");
                *self.session.lock() = previous;
            }
            Err(e) => {
                tracing::error!("Firmware download failed: {e}");
                {
                    let mut store = self.store.lock();
                    if matches!(store.inactive_state(), InactiveSlot::Writing { .. })
                        && let Err(err) = store.invalidate()
                    {
                        tracing::warn!("Failed to discard partial image: {err}");
                    }
                }
                if let Some(session) = self.session.lock().as_mut() {
                    session.state = DownloadState::Failed;
                    session.error = Some(e);
                }
            }
        }
    }

    fn reset_progress(&self) {
        if let Some(session) = self.session.lock().as_mut() {
            session.bytes_written = 0;
            session.logged_decile = 0;
        }
    }

    fn record_written(&self, len: usize) {
        if let Some(session) = self.session.lock().as_mut() {
            session.bytes_written += len as u64;
            let Some(total) = session.total_bytes else {
                return;
            };
            let decile = (session.bytes_written * 10).checked_div(total).unwrap_or(0);
            if decile > session.logged_decile {
                session.logged_decile = decile;
                tracing::info!(
                    "Download progress: {}% ({}/{total} bytes)",
                    decile * 10,
                    session.bytes_written
                );
            }
        }
    }

    /// Check the header and erase the slot for the image it declares.
    fn begin_image(&self, header: &ImageHeader, content_length: Option<u64>) -> std::result::Result<u32, AttemptError> {
        ensure_not_downgrade(header.version, self.running).map_err(AttemptError::Fatal)?;
        if let Some(expected) = self.expected_version
            && header.version != expected
        {
            return Err(AttemptError::Fatal(OtaError::PartitionInvalid(format!(
                "image version {} does not match requested {expected}",
                header.version
            ))));
        }
        if let Some(length) = content_length
            && length != header.image_len()
        {
            return Err(AttemptError::Fatal(OtaError::PartitionInvalid(format!(
                "content length {length} does not match image size {}",
                header.image_len()
            ))));
        }

        let size = u32::try_from(header.image_len()).map_err(|_| {
            AttemptError::Fatal(OtaError::PartitionInvalid("image larger than 4 GiB".to_owned()))
        })?;
        self.store.lock().begin(size).map_err(AttemptError::Fatal)?;

        if let Some(session) = self.session.lock().as_mut() {
            session.total_bytes = Some(u64::from(size));
            session.version = Some(header.version);
        }
        Ok(size)
    }

    async fn attempt(&self) -> std::result::Result<FirmwareRelease, AttemptError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| AttemptError::Retry(transport_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::classify(OtaError::HttpStatus(status.as_u16())));
        }

        let content_length = response.content_length();
        let mut stream = response.bytes_stream();
        let mut pending = BytesMut::with_capacity(BLOCK_SIZE as usize * 2);
        let mut expected_size: Option<u32> = None;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AttemptError::Retry(transport_error(&e)))?;
            pending.extend_from_slice(&chunk);

            if expected_size.is_none() {
                if pending.len() < HEADER_LEN {
                    continue;
                }
                let header = ImageHeader::parse(&pending).map_err(AttemptError::Fatal)?;
                expected_size = Some(self.begin_image(&header, content_length)?);
            }

            while pending.len() >= BLOCK_SIZE as usize {
                let block = pending.split_to(BLOCK_SIZE as usize);
                self.write(&block)?;
                written += block.len() as u64;
            }
        }

        let Some(expected_size) = expected_size else {
            return Err(AttemptError::Fatal(OtaError::PartitionInvalid(format!(
                "response of {} bytes is too short for an image",
                pending.len()
            ))));
        };
        if !pending.is_empty() {
            self.write(&pending)?;
            written += pending.len() as u64;
        }

        if written != u64::from(expected_size) {
            return Err(AttemptError::Retry(OtaError::Transport(format!(
                "connection closed after {written} of {expected_size} bytes"
            ))));
        }

        self.store.lock().finalize().map_err(AttemptError::Fatal)
    }

    fn write(&self, data: &[u8]) -> std::result::Result<(), AttemptError> {
        // Flash errors are never retried
        self.store.lock().append(data).map_err(AttemptError::Fatal)?;
        self.record_written(data.len());
        Ok(())
    }
}

fn transport_error(err: &reqwest::Error) -> OtaError {
    if err.is_timeout() {
        OtaError::Timeout(err.to_string())
    } else {
        OtaError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{MemoryPartitions, build_image};
    use std::io::Write;
    use std::time::Duration;

    const RUNNING: FirmwareVersion = FirmwareVersion::new(1, 0, 0);

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            max_retries: 3,
            retry_delay_ms: 10,
            timeout_secs: 5,
        }
    }

    fn manager() -> (DownloadManager, Arc<Mutex<ImageStore>>) {
        manager_with_capacity(256 * 1024)
    }

    fn manager_with_capacity(capacity: u32) -> (DownloadManager, Arc<Mutex<ImageStore>>) {
        let store = Arc::new(Mutex::new(ImageStore::new(Box::new(MemoryPartitions::new(
            capacity,
        )))));
        let manager = DownloadManager::new(fast_config(), Arc::clone(&store)).unwrap();
        (manager, store)
    }

    fn firmware(version: FirmwareVersion, len: usize) -> Vec<u8> {
        let payload: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        build_image(version, &payload).unwrap().to_vec()
    }

    async fn wait_until_settled(manager: &DownloadManager) {
        for _ in 0..500 {
            if !manager.is_downloading() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download did not finish");
    }

    #[tokio::test]
    async fn test_download_stages_image() {
        let mut server = mockito::Server::new_async().await;
        let image = firmware(FirmwareVersion::new(1, 1, 0), 10_000);
        let mock = server
            .mock("GET", "/firmware.bin")
            .with_status(200)
            .with_body(image.clone())
            .create_async()
            .await;

        let (mut manager, store) = manager();
        let url = format!("{}/firmware.bin", server.url());
        manager.start_download(&url, None, RUNNING).unwrap();
        wait_until_settled(&manager).await;

        mock.assert_async().await;
        let status = manager.status();
        assert_eq!(status.state, DownloadState::Complete);
        assert!((status.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(status.version, Some(FirmwareVersion::new(1, 1, 0)));

        let store = store.lock();
        assert_eq!(store.ready_release().unwrap().size, image.len() as u32);
        assert_eq!(store.read_image().unwrap().as_ref(), image.as_slice());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing.bin")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let (mut manager, _store) = manager();
        manager
            .start_download(&format!("{}/missing.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;

        mock.assert_async().await;
        let status = manager.status();
        assert_eq!(status.state, DownloadState::Failed);
        assert!(status.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_server_error_retried_three_times() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky.bin")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let (mut manager, _store) = manager();
        manager
            .start_download(&format!("{}/flaky.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;

        mock.assert_async().await;
        assert_eq!(manager.state(), DownloadState::Failed);
        assert!((manager.get_progress()).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_image_larger_than_slot_fails_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/huge.bin")
            .with_body(firmware(FirmwareVersion::new(1, 1, 0), 10_000))
            .expect(1)
            .create_async()
            .await;

        let (mut manager, store) = manager_with_capacity(8 * 1024);
        manager
            .start_download(&format!("{}/huge.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;

        mock.assert_async().await;
        let status = manager.status();
        assert_eq!(status.state, DownloadState::Failed);
        assert!(status.error.unwrap().contains("flash full"));
        assert_eq!(store.lock().inactive_state(), InactiveSlot::Invalid);
    }

    #[tokio::test]
    async fn test_content_length_mismatch_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let mut body = firmware(FirmwareVersion::new(1, 1, 0), 4000);
        body.extend_from_slice(&[0u8; 100]);
        let mock = server
            .mock("GET", "/padded.bin")
            .with_body(body)
            .expect(1)
            .create_async()
            .await;

        let (mut manager, store) = manager();
        manager
            .start_download(&format!("{}/padded.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;

        mock.assert_async().await;
        let status = manager.status();
        assert_eq!(status.state, DownloadState::Failed);
        assert!(status.error.unwrap().contains("content length"));
        assert_eq!(store.lock().inactive_state(), InactiveSlot::Invalid);
    }

    #[tokio::test]
    async fn test_truncated_body_retried_three_times() {
        let mut server = mockito::Server::new_async().await;
        let image = firmware(FirmwareVersion::new(1, 1, 0), 10_000);
        let head = image[..5000].to_vec();
        let mock = server
            .mock("GET", "/cut.bin")
            .with_chunked_body(move |w| w.write_all(&head))
            .expect(4)
            .create_async()
            .await;

        let (mut manager, store) = manager();
        manager
            .start_download(&format!("{}/cut.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;

        mock.assert_async().await;
        let status = manager.status();
        assert_eq!(status.state, DownloadState::Failed);
        assert!(status.error.unwrap().contains("connection closed"));
        assert_eq!(store.lock().inactive_state(), InactiveSlot::Invalid);
    }

    #[tokio::test]
    async fn test_downgrade_in_header_keeps_previous_session() {
        let mut server = mockito::Server::new_async().await;
        let newer = firmware(FirmwareVersion::new(1, 2, 0), 3000);
        let older = firmware(FirmwareVersion::new(0, 9, 0), 3000);
        server
            .mock("GET", "/newer.bin")
            .with_body(newer)
            .create_async()
            .await;
        server
            .mock("GET", "/older.bin")
            .with_body(older)
            .create_async()
            .await;

        let (mut manager, store) = manager();
        manager
            .start_download(&format!("{}/newer.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;
        assert_eq!(manager.state(), DownloadState::Complete);

        manager
            .start_download(&format!("{}/older.bin", server.url()), None, RUNNING)
            .unwrap();
        wait_until_settled(&manager).await;

        let status = manager.status();
        assert_eq!(status.state, DownloadState::Complete);
        assert_eq!(status.version, Some(FirmwareVersion::new(1, 2, 0)));
        assert_eq!(
            store.lock().ready_release().unwrap().version,
            FirmwareVersion::new(1, 2, 0)
        );
    }

    #[tokio::test]
    async fn test_synchronous_rejections() {
        let (mut manager, _store) = manager();

        let err = manager
            .start_download("http://example.invalid/fw.bin", Some(FirmwareVersion::new(0, 1, 0)), RUNNING)
            .unwrap_err();
        assert!(matches!(err, OtaError::RejectedDowngrade { .. }));
        assert_eq!(manager.state(), DownloadState::Idle);

        let err = manager.start_download("ftp://example.com/fw.bin", None, RUNNING).unwrap_err();
        assert!(matches!(err, OtaError::InvalidUrl(_)));
        let err = manager.start_download("not a url", None, RUNNING).unwrap_err();
        assert!(matches!(err, OtaError::InvalidUrl(_)));
        assert_eq!(manager.state(), DownloadState::Idle);
    }

    #[tokio::test]
    async fn test_busy_and_cancel() {
        let mut server = mockito::Server::new_async().await;
        let image = firmware(FirmwareVersion::new(1, 1, 0), 8000);
        let head = image[..2048].to_vec();
        server
            .mock("GET", "/slow.bin")
            .with_chunked_body(move |w| {
                w.write_all(&head)?;
                w.flush()?;
                std::thread::sleep(Duration::from_secs(3));
                Ok(())
            })
            .create_async()
            .await;

        let (mut manager, store) = manager();
        let url = format!("{}/slow.bin", server.url());
        manager.start_download(&url, None, RUNNING).unwrap();

        for _ in 0..200 {
            if manager.status().bytes_written > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_downloading());
        assert!(manager.get_progress() > 0.0);

        assert_eq!(
            manager.start_download(&url, None, RUNNING).unwrap_err(),
            OtaError::RejectedBusy("download")
        );

        manager.cancel_download().unwrap();
        assert_eq!(manager.state(), DownloadState::Idle);
        assert!(manager.get_progress().abs() < f64::EPSILON);
        assert_eq!(store.lock().inactive_state(), InactiveSlot::Invalid);
    }
}
