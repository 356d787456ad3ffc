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

//! UDP stand-in for the radio mesh
//!
//! Every datagram starts with the 6-byte address of its sender, followed by
//! one OTA frame. A datagram with nothing after the address is a heartbeat.
//! Links are static: the peers come from the configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use lyktparad_ota::{MeshEvent, MeshTransport, NodeAddr, NodeRole, OtaError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;

const ADDR_LEN: usize = 6;
const MAX_DATAGRAM: usize = 2048;
const MISSED_HEARTBEATS: u32 = 3;

#[derive(Debug)]
pub struct UdpMesh {
    local: NodeAddr,
    role: NodeRole,
    socket: UdpSocket,
    peers: BTreeMap<NodeAddr, SocketAddr>,
    parent: Option<NodeAddr>,
    uplink_probe_url: Option<String>,
    heartbeat: Duration,
}

impl UdpMesh {
    pub async fn bind(config: &MeshConfig, local: NodeAddr, role: NodeRole) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("Failed to bind mesh socket on {}", config.listen))?;
        info!(
            "Mesh socket for {local} listening on {} with {} peers",
            config.listen,
            config.peers.len()
        );
        Ok(Arc::new(Self {
            local,
            role,
            socket,
            peers: config
                .peers
                .iter()
                .map(|peer| (peer.address, peer.endpoint))
                .collect(),
            parent: config
                .peers
                .iter()
                .find(|peer| peer.parent)
                .map(|peer| peer.address),
            uplink_probe_url: config.uplink_probe_url.clone(),
            heartbeat: config.heartbeat(),
        }))
    }

    /// Start delivering traffic and link changes to `events`. The tasks end
    /// when the receiver is dropped or the handles are aborted.
    pub fn spawn(self: &Arc<Self>, events: mpsc::Sender<MeshEvent>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(Arc::clone(self).pump(events.clone()))];
        if self.role == NodeRole::Root {
            tasks.push(tokio::spawn(Arc::clone(self).watch_uplink(events)));
        }
        tasks
    }

    fn datagram(&self, frame: &[u8]) -> Bytes {
        let mut datagram = BytesMut::with_capacity(ADDR_LEN + frame.len());
        datagram.put_slice(&self.local.0);
        datagram.put_slice(frame);
        datagram.freeze()
    }

    async fn send_heartbeats(&self) {
        let heartbeat = self.datagram(&[]);
        for endpoint in self.peers.values() {
            if let Err(e) = self.socket.send_to(&heartbeat, endpoint).await {
                debug!("Heartbeat to {endpoint} failed: {e}");
            }
        }
    }

    /// Receive loop, heartbeats and parent link supervision.
    async fn pump(self: Arc<Self>, events: mpsc::Sender<MeshEvent>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let link_timeout = self.heartbeat * MISSED_HEARTBEATS;
        let mut parent_heard: Option<Instant> = None;
        let mut parent_up = false;

        loop {
            let event = tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, endpoint) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Mesh receive failed: {e}");
                            continue;
                        }
                    };
                    let Some((from, frame)) = self.parse(buf.get(..len).unwrap_or_default(), endpoint) else {
                        continue;
                    };
                    if Some(from) == self.parent {
                        parent_heard = Some(Instant::now());
                        if !parent_up {
                            parent_up = true;
                            info!("Parent link to {from} is up");
                            if events.send(MeshEvent::Connected).await.is_err() {
                                return;
                            }
                        }
                    }
                    if frame.is_empty() {
                        continue;
                    }
                    MeshEvent::Frame { from, payload: frame }
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeats().await;
                    let lost = parent_heard.is_some_and(|heard| heard.elapsed() >= link_timeout);
                    if !(parent_up && lost) {
                        continue;
                    }
                    parent_up = false;
                    warn!("Parent link lost, no heartbeat for {}s", link_timeout.as_secs());
                    MeshEvent::Disconnected
                }
            };

            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    fn parse(&self, datagram: &[u8], endpoint: SocketAddr) -> Option<(NodeAddr, Bytes)> {
        let Some((addr, frame)) = datagram.split_first_chunk::<ADDR_LEN>() else {
            debug!("Runt datagram from {endpoint}");
            return None;
        };
        let from = NodeAddr(*addr);
        if !self.peers.contains_key(&from) {
            debug!("Datagram from unknown node {from} at {endpoint}, dropping");
            return None;
        }
        Some((from, Bytes::copy_from_slice(frame)))
    }

    /// The root counts as connected while its uplink answers. Without a probe
    /// URL the uplink is assumed to be up.
    async fn watch_uplink(self: Arc<Self>, events: mpsc::Sender<MeshEvent>) {
        let Some(url) = self.uplink_probe_url.clone() else {
            info!("No uplink probe configured, root considered connected");
            let _ = events.send(MeshEvent::Connected).await;
            return;
        };

        let client = match reqwest::Client::builder().timeout(self.heartbeat).build() {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot build uplink probe client: {e}");
                return;
            }
        };

        let mut interval = tokio::time::interval(self.heartbeat);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut up = false;
        loop {
            interval.tick().await;
            let reachable = client.get(&url).send().await.is_ok();
            if reachable == up {
                continue;
            }
            up = reachable;
            let event = if up {
                info!("Uplink {url} reachable");
                MeshEvent::Connected
            } else {
                warn!("Uplink {url} unreachable");
                MeshEvent::Disconnected
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl MeshTransport for UdpMesh {
    fn local_addr(&self) -> NodeAddr {
        self.local
    }

    fn routing_table(&self) -> Vec<NodeAddr> {
        self.peers.keys().copied().collect()
    }

    async fn send(&self, to: NodeAddr, frame: Bytes) -> lyktparad_ota::Result<()> {
        let endpoint = self
            .peers
            .get(&to)
            .ok_or_else(|| OtaError::Transport(format!("no route to {to}")))?;
        self.socket.send_to(&self.datagram(&frame), endpoint).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use lyktparad_ota::OtaMessage;

    const ROOT: NodeAddr = NodeAddr([0x24, 0x0a, 0xc4, 0, 0, 0x01]);
    const NODE: NodeAddr = NodeAddr([0x24, 0x0a, 0xc4, 0, 0, 0x0a]);

    async fn free_port() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    }

    fn mesh_config(listen: SocketAddr, peer: NodeAddr, endpoint: SocketAddr, parent: bool) -> MeshConfig {
        MeshConfig {
            listen,
            peers: vec![PeerConfig {
                address: peer,
                endpoint,
                parent,
            }],
            uplink_probe_url: None,
            heartbeat_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_frames_and_parent_link() {
        let root_addr = free_port().await;
        let node_addr = free_port().await;
        let root = UdpMesh::bind(&mesh_config(root_addr, NODE, node_addr, false), ROOT, NodeRole::Root)
            .await
            .unwrap();
        let node = UdpMesh::bind(&mesh_config(node_addr, ROOT, root_addr, true), NODE, NodeRole::Node)
            .await
            .unwrap();

        let (root_events, mut root_rx) = mpsc::channel(16);
        let (node_events, mut node_rx) = mpsc::channel(16);
        let root_tasks = root.spawn(root_events);
        let node_tasks = node.spawn(node_events);

        assert_eq!(root_rx.recv().await, Some(MeshEvent::Connected));
        assert_eq!(node_rx.recv().await, Some(MeshEvent::Connected));

        assert_eq!(root.routing_table(), vec![NODE]);
        root.send(NODE, OtaMessage::Ack { index: 7 }.encode()).await.unwrap();
        let event = node_rx.recv().await.unwrap();
        let MeshEvent::Frame { from, payload } = event else {
            panic!("expected a frame, got {event:?}");
        };
        assert_eq!(from, ROOT);
        assert_eq!(OtaMessage::decode(&payload).unwrap(), OtaMessage::Ack { index: 7 });

        assert!(root.send(NodeAddr([9; 6]), Bytes::new()).await.is_err());

        for task in root_tasks.into_iter().chain(node_tasks) {
            task.abort();
        }
    }
}
