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

//! Mesh transport seam
//!
//! Topology formation is done elsewhere; the rollout engine only needs to
//! address peers, send frames and hear about connectivity.

use crate::error::{OtaError, Result};
use crate::wire::OtaMessage;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 6-byte mesh node address, written as `aa:bb:cc:dd:ee:ff`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddr(pub [u8; 6]);

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for NodeAddr {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self> {
        let mut addr = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in &mut addr {
            let part = parts
                .next()
                .ok_or_else(|| OtaError::Config(format!("Invalid node address: {s}")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| OtaError::Config(format!("Invalid node address: {s}")))?;
        }
        if parts.next().is_some() {
            return Err(OtaError::Config(format!("Invalid node address: {s}")));
        }
        Ok(Self(addr))
    }
}

impl TryFrom<String> for NodeAddr {
    type Error = OtaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NodeAddr> for String {
    fn from(addr: NodeAddr) -> Self {
        addr.to_string()
    }
}

/// Where a node sits in the mesh tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Root,
    Node,
}

/// Something the transport delivers to the node runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Frame { from: NodeAddr, payload: Bytes },
    /// Parent link up (node) or router/uplink link up (root)
    Connected,
    Disconnected,
}

/// A protocol message addressed to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeAddr,
    pub message: OtaMessage,
}

impl Outbound {
    pub fn new(to: NodeAddr, message: OtaMessage) -> Self {
        Self { to, message }
    }
}

#[async_trait]
pub trait MeshTransport: Send + Sync + fmt::Debug {
    fn local_addr(&self) -> NodeAddr;

    /// Every other node currently reachable through the mesh
    fn routing_table(&self) -> Vec<NodeAddr>;

    async fn send(&self, to: NodeAddr, frame: Bytes) -> Result<()>;
}
