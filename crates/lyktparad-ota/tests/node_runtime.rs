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

use async_trait::async_trait;
use bytes::Bytes;
use lyktparad_ota::image::build_image;
use lyktparad_ota::wire::ReadyStatus;
use lyktparad_ota::{
    DownloadState, FirmwareVersion, MemoryPartitions, MemoryStateStore, MeshEvent, MeshTransport,
    NodeAddr, NodeExit, NodeRole, OtaCommandSender, OtaConfig, OtaError, OtaMessage, OtaNode,
    Slot, StateStore,
};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const ROOT: NodeAddr = NodeAddr([0x24, 0x0a, 0xc4, 0, 0, 0x01]);
const NODE: NodeAddr = NodeAddr([0x24, 0x0a, 0xc4, 0, 0, 0x0a]);

const OLD: FirmwareVersion = FirmwareVersion::new(1, 0, 0);
const NEW: FirmwareVersion = FirmwareVersion::new(1, 1, 0);
const FLASH: u32 = 256 * 1024;

fn image(version: FirmwareVersion, payload_len: usize) -> Bytes {
    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    build_image(version, &payload).unwrap()
}

/// Mesh that records every frame instead of sending it
#[derive(Debug)]
struct RecordingMesh {
    addr: NodeAddr,
    peers: Vec<NodeAddr>,
    sent: Mutex<Vec<(NodeAddr, OtaMessage)>>,
}

impl RecordingMesh {
    fn new(addr: NodeAddr, peers: Vec<NodeAddr>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            peers,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(NodeAddr, OtaMessage)> {
        self.sent.lock().clone()
    }

    async fn wait_for(&self, count: usize, matches: impl Fn(&OtaMessage) -> bool) {
        for _ in 0..300 {
            if self.sent.lock().iter().filter(|(_, m)| matches(m)).count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} matching frames, sent: {:?}", self.sent());
    }
}

#[async_trait]
impl MeshTransport for RecordingMesh {
    fn local_addr(&self) -> NodeAddr {
        self.addr
    }

    fn routing_table(&self) -> Vec<NodeAddr> {
        self.peers.clone()
    }

    async fn send(&self, to: NodeAddr, frame: Bytes) -> lyktparad_ota::Result<()> {
        let message = OtaMessage::decode(&frame)?;
        self.sent.lock().push((to, message));
        Ok(())
    }
}

fn boot(
    role: NodeRole,
    mesh: &Arc<RecordingMesh>,
    partitions: &MemoryPartitions,
    state: &Arc<MemoryStateStore>,
) -> OtaNode {
    let transport: Arc<dyn MeshTransport> = Arc::clone(mesh) as Arc<dyn MeshTransport>;
    let state_store: Arc<dyn StateStore> = Arc::clone(state) as Arc<dyn StateStore>;
    OtaNode::boot(
        OtaConfig::default(),
        role,
        transport,
        Box::new(partitions.clone()),
        state_store,
        OLD,
    )
    .unwrap()
}

/// Download `url` through the command channel and wait until it is staged.
async fn stage_release(sender: &OtaCommandSender, url: String) {
    sender.start_download(url, Some(NEW)).await.unwrap();
    for _ in 0..300 {
        if sender.download_status().await.unwrap().state == DownloadState::Complete {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("download did not complete");
}

fn count(sent: &[(NodeAddr, OtaMessage)], matches: impl Fn(&OtaMessage) -> bool) -> usize {
    sent.iter().filter(|(_, message)| matches(message)).count()
}

#[tokio::test]
async fn test_root_rollout_without_peers_switches_and_commits() {
    let mut server = mockito::Server::new_async().await;
    let firmware = image(NEW, 12_000);
    let mock = server
        .mock("GET", "/lyktparad-1.1.0.bin")
        .with_status(200)
        .with_body(firmware.to_vec())
        .create_async()
        .await;
    let url = format!("{}/lyktparad-1.1.0.bin", server.url());

    let partitions = MemoryPartitions::with_running_image(FLASH, &image(OLD, 4096)).unwrap();
    let state = Arc::new(MemoryStateStore::default());
    let mesh = RecordingMesh::new(ROOT, Vec::new());

    let node = boot(NodeRole::Root, &mesh, &partitions, &state);
    assert_eq!(state.snapshot().current_version, Some(OLD));

    let (events, events_rx) = mpsc::channel(16);
    let (sender, mut channel) = OtaCommandSender::new();
    let driver = async move {
        stage_release(&sender, url).await;
        assert_eq!(sender.version().await.unwrap().staged, Some(NEW));

        sender.start_distribution().await.unwrap();
        let status = sender.distribution_status().await.unwrap();
        assert!(!status.distributing);
        assert_eq!(status.nodes_total, 0);

        sender.start_reboot(None, Some(20)).await.unwrap();
        events
    };

    let (exit, _events) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Restart);
    mock.assert_async().await;
    assert!(state.snapshot().rollback_pending);

    // Second boot runs the new image and commits once the mesh is back
    let partitions = partitions.reopen();
    let node = boot(NodeRole::Root, &mesh, &partitions, &state);
    assert_eq!(node.running_version(), NEW);

    let (events, events_rx) = mpsc::channel(16);
    let (sender, mut channel) = OtaCommandSender::new();
    let driver = async move {
        assert!(sender.version().await.unwrap().rollback_pending);
        events.send(MeshEvent::Connected).await.unwrap();
        for _ in 0..300 {
            if !sender.version().await.unwrap().rollback_pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let info = sender.version().await.unwrap();
        assert_eq!(info.version, NEW);
        assert_eq!(info.running_slot, Slot::B);
        drop(events);
    };

    let (exit, ()) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Shutdown);

    let committed = state.snapshot();
    assert!(!committed.rollback_pending);
    assert_eq!(committed.rollback_attempts, 0);
    assert_eq!(committed.current_version, Some(NEW));
    assert!(committed.committed_at.is_some());
}

#[tokio::test]
async fn test_node_receives_image_and_reboots_on_command() {
    let firmware = image(NEW, 3_000);
    let partitions = MemoryPartitions::with_running_image(FLASH, &image(OLD, 4096)).unwrap();
    let state = Arc::new(MemoryStateStore::default());
    let mesh = RecordingMesh::new(NODE, Vec::new());
    let node = boot(NodeRole::Node, &mesh, &partitions, &state);

    let (events, events_rx) = mpsc::channel(16);
    let (_sender, mut channel) = OtaCommandSender::new();
    let frame = |message: OtaMessage| MeshEvent::Frame {
        from: ROOT,
        payload: message.encode(),
    };

    let driver = {
        let mesh = Arc::clone(&mesh);
        let firmware = firmware.clone();
        async move {
            events
                .send(frame(OtaMessage::Start {
                    block_count: 3,
                    size: firmware.len() as u32,
                    version: NEW,
                }))
                .await
                .unwrap();
            for (index, chunk) in firmware.chunks(1024).enumerate() {
                let block = OtaMessage::block(index as u16, Bytes::copy_from_slice(chunk));
                events.send(frame(block)).await.unwrap();
            }
            mesh.wait_for(3, |m| matches!(m, OtaMessage::Ack { .. })).await;

            events.send(frame(OtaMessage::PrepareReboot)).await.unwrap();
            mesh.wait_for(1, |m| matches!(m, OtaMessage::ReadyAck { .. }))
                .await;

            events
                .send(frame(OtaMessage::Reboot { delay_ms: 10 }))
                .await
                .unwrap();
            events
        }
    };

    let (exit, _events) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Restart);

    let sent = mesh.sent();
    assert!(sent.iter().all(|(to, _)| *to == ROOT));
    assert!(sent.contains(&(
        ROOT,
        OtaMessage::ReadyAck {
            status: ReadyStatus::Ready
        }
    )));
    assert!(state.snapshot().rollback_pending);

    let store = lyktparad_ota::ImageStore::new(Box::new(partitions.reopen()));
    assert_eq!(store.running_slot(), Slot::B);
    assert_eq!(store.running_version(), Some(NEW));
}

#[tokio::test]
async fn test_plain_node_rejects_root_commands() {
    let partitions = MemoryPartitions::with_running_image(FLASH, &image(OLD, 4096)).unwrap();
    let state = Arc::new(MemoryStateStore::default());
    let mesh = RecordingMesh::new(NODE, Vec::new());
    let node = boot(NodeRole::Node, &mesh, &partitions, &state);

    let (events, events_rx) = mpsc::channel(16);
    let (sender, mut channel) = OtaCommandSender::new();
    let driver = async move {
        assert_eq!(
            sender
                .start_download("http://127.0.0.1:1/fw.bin".to_owned(), None)
                .await,
            Err(OtaError::NotRoot)
        );
        assert_eq!(sender.start_distribution().await, Err(OtaError::NotRoot));
        assert_eq!(sender.start_reboot(None, None).await, Err(OtaError::NotRoot));

        let info = sender.version().await.unwrap();
        assert_eq!(info.role, NodeRole::Node);
        assert_eq!(info.version, OLD);
        assert_eq!(info.staged, None);
        drop(events);
    };

    let (exit, ()) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Shutdown);
    assert!(mesh.sent().is_empty());
}

#[tokio::test]
async fn test_root_refuses_reboot_without_distribution() {
    let partitions = MemoryPartitions::with_running_image(FLASH, &image(OLD, 4096)).unwrap();
    let state = Arc::new(MemoryStateStore::default());
    let mesh = RecordingMesh::new(ROOT, vec![NODE]);
    let node = boot(NodeRole::Root, &mesh, &partitions, &state);

    let (events, events_rx) = mpsc::channel(16);
    let (sender, mut channel) = OtaCommandSender::new();
    let driver = async move {
        assert_eq!(
            sender.start_distribution().await,
            Err(OtaError::NoReleaseStaged)
        );
        assert!(matches!(
            sender.start_reboot(None, None).await,
            Err(OtaError::RejectedIncompleteDistribution { .. })
        ));
        assert!(matches!(
            sender.start_download("ftp://example.com/fw.bin".to_owned(), None).await,
            Err(OtaError::InvalidUrl(_))
        ));
        assert!(matches!(
            sender
                .start_download(
                    "http://127.0.0.1:1/fw.bin".to_owned(),
                    Some(FirmwareVersion::new(0, 9, 0))
                )
                .await,
            Err(OtaError::RejectedDowngrade { .. })
        ));
        drop(events);
    };

    let (exit, ()) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Shutdown);
    assert!(
        mesh.sent()
            .iter()
            .all(|(_, message)| matches!(message, OtaMessage::Status { .. }))
    );
}

#[tokio::test]
async fn test_request_starts_distribution_when_idle() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/lyktparad-1.1.0.bin")
        .with_body(image(NEW, 5_000).to_vec())
        .create_async()
        .await;
    let url = format!("{}/lyktparad-1.1.0.bin", server.url());

    let partitions = MemoryPartitions::with_running_image(FLASH, &image(OLD, 4096)).unwrap();
    let state = Arc::new(MemoryStateStore::default());
    let mesh = RecordingMesh::new(ROOT, vec![NODE]);
    let node = boot(NodeRole::Root, &mesh, &partitions, &state);

    let (events, events_rx) = mpsc::channel(16);
    let (sender, mut channel) = OtaCommandSender::new();
    let request = || MeshEvent::Frame {
        from: NODE,
        payload: OtaMessage::Request { version: OLD }.encode(),
    };

    let driver = {
        let mesh = Arc::clone(&mesh);
        async move {
            // Nothing staged yet, the request is logged and dropped
            events.send(request()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!sender.distribution_status().await.unwrap().distributing);
            assert_eq!(count(&mesh.sent(), |m| matches!(m, OtaMessage::Start { .. })), 0);

            stage_release(&sender, url).await;
            events.send(request()).await.unwrap();
            mesh.wait_for(1, |m| matches!(m, OtaMessage::Start { .. })).await;
            mesh.wait_for(1, |m| matches!(m, OtaMessage::Block { .. })).await;

            let status = sender.distribution_status().await.unwrap();
            assert!(status.distributing);
            assert_eq!(status.nodes_total, 1);

            // A second request joins the running session instead of restarting it
            events.send(request()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let sent = mesh.sent();
            assert_eq!(count(&sent, |m| matches!(m, OtaMessage::Start { .. })), 1);
            assert_eq!(
                count(&sent, |m| matches!(m, OtaMessage::Block { index: 0, .. })),
                1
            );
            assert!(sender.distribution_status().await.unwrap().distributing);
            drop(events);
        }
    };

    let (exit, ()) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Shutdown);

    let sent = mesh.sent();
    assert!(sent.iter().all(|(to, _)| *to == NODE));
    assert!(sent.contains(&(
        NODE,
        OtaMessage::Start {
            block_count: 5,
            size: 5_000 + 64,
            version: NEW,
        }
    )));
}

#[tokio::test]
async fn test_distribution_refused_while_download_runs() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/lyktparad-1.1.0.bin")
        .with_body(image(NEW, 5_000).to_vec())
        .create_async()
        .await;
    server
        .mock("GET", "/lyktparad-1.2.0.bin")
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_secs(2));
            w.flush()
        })
        .create_async()
        .await;

    let partitions = MemoryPartitions::with_running_image(FLASH, &image(OLD, 4096)).unwrap();
    let state = Arc::new(MemoryStateStore::default());
    let mesh = RecordingMesh::new(ROOT, vec![NODE]);
    let node = boot(NodeRole::Root, &mesh, &partitions, &state);

    let (events, events_rx) = mpsc::channel(16);
    let (sender, mut channel) = OtaCommandSender::new();
    let driver = async move {
        stage_release(&sender, format!("{}/lyktparad-1.1.0.bin", server.url())).await;

        // The next download has not delivered its header yet, the staged
        // image is still marked ready but is about to be overwritten
        sender
            .start_download(format!("{}/lyktparad-1.2.0.bin", server.url()), None)
            .await
            .unwrap();
        assert_eq!(
            sender.download_status().await.unwrap().state,
            DownloadState::InProgress
        );

        assert_eq!(
            sender.start_distribution().await,
            Err(OtaError::RejectedBusy("download"))
        );
        assert!(!sender.distribution_status().await.unwrap().distributing);

        sender.cancel_download().await.unwrap();
        drop(events);
    };

    let (exit, ()) = tokio::join!(node.run(events_rx, &mut channel), driver);
    assert_eq!(exit, NodeExit::Shutdown);
    assert_eq!(count(&mesh.sent(), |m| matches!(m, OtaMessage::Start { .. })), 0);
}
