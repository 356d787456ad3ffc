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

//! Binary mesh messages of the rollout protocol
//!
//! The first byte of a frame is the command tag, all integers are big-endian
//! and versions travel as three `u16`s.

use crate::error::OtaError;
use crate::image::BLOCK_SIZE;
use crate::version::FirmwareVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const TAG_REQUEST: u8 = 0xF0;
pub const TAG_START: u8 = 0xF1;
pub const TAG_BLOCK: u8 = 0xF2;
pub const TAG_ACK: u8 = 0xF3;
pub const TAG_STATUS: u8 = 0xF4;
pub const TAG_PREPARE_REBOOT: u8 = 0xF5;
pub const TAG_REBOOT: u8 = 0xF6;
pub const TAG_READY_ACK: u8 = 0xFB;
pub const TAG_STATUS_REPORT: u8 = 0xFC;

const VERSION_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("truncated frame for tag {tag:#04x}: need {needed} bytes, got {got}")]
    Truncated { tag: u8, needed: usize, got: usize },

    #[error("block payload of {len} bytes exceeds the block size")]
    Oversize { len: usize },

    #[error("bad field: {0}")]
    BadField(&'static str),
}

impl From<WireError> for OtaError {
    fn from(err: WireError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Reply to PREPARE_REBOOT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStatus {
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaMessage {
    /// Node asks the root for the release it advertised
    Request { version: FirmwareVersion },
    Start {
        block_count: u16,
        size: u32,
        version: FirmwareVersion,
    },
    Block { index: u16, crc32: u32, data: Bytes },
    Ack { index: u16 },
    /// Root query, advertising the staged release if there is one
    Status { available: Option<FirmwareVersion> },
    PrepareReboot,
    Reboot { delay_ms: u32 },
    ReadyAck { status: ReadyStatus },
    StatusReport {
        running: FirmwareVersion,
        staged: Option<FirmwareVersion>,
    },
    Unknown { tag: u8 },
}

impl OtaMessage {
    /// BLOCK message with the checksum computed over `data`.
    pub fn block(index: u16, data: Bytes) -> Self {
        Self::Block {
            index,
            crc32: crc32fast::hash(&data),
            data,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "REQUEST",
            Self::Start { .. } => "START",
            Self::Block { .. } => "BLOCK",
            Self::Ack { .. } => "ACK",
            Self::Status { .. } => "STATUS",
            Self::PrepareReboot => "PREPARE_REBOOT",
            Self::Reboot { .. } => "REBOOT",
            Self::ReadyAck { .. } => "READY_ACK",
            Self::StatusReport { .. } => "STATUS_REPORT",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::Request { version } => {
                buf.put_u8(TAG_REQUEST);
                put_version(&mut buf, *version);
            }
            Self::Start {
                block_count,
                size,
                version,
            } => {
                buf.put_u8(TAG_START);
                buf.put_u16(*block_count);
                buf.put_u32(*size);
                put_version(&mut buf, *version);
            }
            Self::Block { index, crc32, data } => {
                buf.reserve(data.len() + 8);
                buf.put_u8(TAG_BLOCK);
                buf.put_u16(*index);
                buf.put_u32(*crc32);
                buf.put_u16(u16::try_from(data.len()).unwrap_or(u16::MAX));
                buf.put_slice(data);
            }
            Self::Ack { index } => {
                buf.put_u8(TAG_ACK);
                buf.put_u16(*index);
            }
            Self::Status { available } => {
                buf.put_u8(TAG_STATUS);
                put_optional_version(&mut buf, *available);
            }
            Self::PrepareReboot => buf.put_u8(TAG_PREPARE_REBOOT),
            Self::Reboot { delay_ms } => {
                buf.put_u8(TAG_REBOOT);
                buf.put_u32(*delay_ms);
            }
            Self::ReadyAck { status } => {
                buf.put_u8(TAG_READY_ACK);
                buf.put_u8(match status {
                    ReadyStatus::Ready => 0,
                    ReadyStatus::Error => 1,
                });
            }
            Self::StatusReport { running, staged } => {
                buf.put_u8(TAG_STATUS_REPORT);
                put_version(&mut buf, *running);
                put_optional_version(&mut buf, *staged);
            }
            Self::Unknown { tag } => buf.put_u8(*tag),
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let Some((&tag, mut body)) = frame.split_first() else {
            return Err(WireError::Empty);
        };

        let need = |needed: usize, body: &[u8]| {
            if body.remaining() < needed {
                Err(WireError::Truncated {
                    tag,
                    needed,
                    got: body.remaining(),
                })
            } else {
                Ok(())
            }
        };

        let message = match tag {
            TAG_REQUEST => {
                need(VERSION_LEN, body)?;
                Self::Request {
                    version: get_version(&mut body),
                }
            }
            TAG_START => {
                need(6 + VERSION_LEN, body)?;
                let block_count = body.get_u16();
                let size = body.get_u32();
                let version = get_version(&mut body);
                if u32::from(block_count) != size.div_ceil(BLOCK_SIZE) {
                    return Err(WireError::BadField("block_count does not match size"));
                }
                Self::Start {
                    block_count,
                    size,
                    version,
                }
            }
            TAG_BLOCK => {
                need(8, body)?;
                let index = body.get_u16();
                let crc32 = body.get_u32();
                let len = usize::from(body.get_u16());
                if len > BLOCK_SIZE as usize {
                    return Err(WireError::Oversize { len });
                }
                need(len, body)?;
                Self::Block {
                    index,
                    crc32,
                    data: body.copy_to_bytes(len),
                }
            }
            TAG_ACK => {
                need(2, body)?;
                Self::Ack {
                    index: body.get_u16(),
                }
            }
            TAG_STATUS => {
                need(1 + VERSION_LEN, body)?;
                Self::Status {
                    available: get_optional_version(&mut body)?,
                }
            }
            TAG_PREPARE_REBOOT => Self::PrepareReboot,
            TAG_REBOOT => {
                need(4, body)?;
                Self::Reboot {
                    delay_ms: body.get_u32(),
                }
            }
            TAG_READY_ACK => {
                need(1, body)?;
                // Anything but an explicit 0 counts as not ready
                let status = if body.get_u8() == 0 {
                    ReadyStatus::Ready
                } else {
                    ReadyStatus::Error
                };
                Self::ReadyAck { status }
            }
            TAG_STATUS_REPORT => {
                need(1 + 2 * VERSION_LEN, body)?;
                let running = get_version(&mut body);
                let staged = get_optional_version(&mut body)?;
                Self::StatusReport { running, staged }
            }
            other => Self::Unknown { tag: other },
        };

        Ok(message)
    }
}

fn put_version(buf: &mut BytesMut, version: FirmwareVersion) {
    buf.put_u16(version.major);
    buf.put_u16(version.minor);
    buf.put_u16(version.patch);
}

fn put_optional_version(buf: &mut BytesMut, version: Option<FirmwareVersion>) {
    buf.put_u8(u8::from(version.is_some()));
    put_version(buf, version.unwrap_or(FirmwareVersion::new(0, 0, 0)));
}

fn get_version(body: &mut &[u8]) -> FirmwareVersion {
    FirmwareVersion::new(body.get_u16(), body.get_u16(), body.get_u16())
}

fn get_optional_version(body: &mut &[u8]) -> Result<Option<FirmwareVersion>, WireError> {
    let present = body.get_u8();
    let version = get_version(body);
    match present {
        0 => Ok(None),
        1 => Ok(Some(version)),
        _ => Err(WireError::BadField("version presence flag")),
    }
}
