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

//! Firmware image header
//!
//! Layout (64 bytes, little-endian):
//!
//! | offset | size | field                       |
//! |--------|------|-----------------------------|
//! | 0      | 4    | magic `LYKT`                |
//! | 4      | 1    | format (1)                  |
//! | 5      | 3    | reserved                    |
//! | 8      | 6    | version major/minor/patch   |
//! | 14     | 2    | reserved                    |
//! | 16     | 4    | payload length              |
//! | 20     | 12   | reserved                    |
//! | 32     | 32   | SHA-256 of the payload      |

use crate::error::{OtaError, Result};
use crate::version::FirmwareVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

pub const HEADER_LEN: usize = 64;
pub const MAGIC: [u8; 4] = *b"LYKT";
pub const FORMAT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: FirmwareVersion,
    pub payload_len: u32,
    pub digest: [u8; 32],
}

impl ImageHeader {
    /// Parse the header from the first [`HEADER_LEN`] bytes of an image.
    ///
    /// Only the fixed fields are checked here; payload length and digest are
    /// checked by [`validate_image`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(mut buf) = data.get(..HEADER_LEN) else {
            return Err(OtaError::PartitionInvalid(format!(
                "image too short for header: {} bytes",
                data.len()
            )));
        };

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(OtaError::PartitionInvalid("bad image magic".to_owned()));
        }
        let format = buf.get_u8();
        if format != FORMAT {
            return Err(OtaError::PartitionInvalid(format!(
                "unsupported image format {format}"
            )));
        }
        buf.advance(3);
        let version = FirmwareVersion::new(buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le());
        buf.advance(2);
        let payload_len = buf.get_u32_le();
        buf.advance(12);
        let mut digest = [0u8; 32];
        buf.copy_to_slice(&mut digest);

        Ok(Self {
            version,
            payload_len,
            digest,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&MAGIC);
        buf.put_u8(FORMAT);
        buf.put_bytes(0, 3);
        buf.put_u16_le(self.version.major);
        buf.put_u16_le(self.version.minor);
        buf.put_u16_le(self.version.patch);
        buf.put_bytes(0, 2);
        buf.put_u32_le(self.payload_len);
        buf.put_bytes(0, 12);
        buf.put_slice(&self.digest);
        out
    }

    /// Total image size (header + payload) this header declares.
    pub fn image_len(&self) -> u64 {
        HEADER_LEN as u64 + u64::from(self.payload_len)
    }
}

/// Check that a complete image is structurally well-formed and return its header.
pub fn validate_image(image: &[u8]) -> Result<ImageHeader> {
    let header = ImageHeader::parse(image)?;
    if image.len() as u64 != header.image_len() {
        return Err(OtaError::PartitionInvalid(format!(
            "image length {} does not match header ({} bytes)",
            image.len(),
            header.image_len()
        )));
    }

    let payload = image.get(HEADER_LEN..).unwrap_or_default();
    let digest: [u8; 32] = Sha256::digest(payload).into();
    if digest != header.digest {
        return Err(OtaError::PartitionInvalid(
            "payload digest does not match header".to_owned(),
        ));
    }

    Ok(header)
}

/// Assemble a complete image for `payload`.
pub fn build_image(version: FirmwareVersion, payload: &[u8]) -> Result<Bytes> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| OtaError::PartitionInvalid("payload larger than 4 GiB".to_owned()))?;
    let header = ImageHeader {
        version,
        payload_len,
        digest: Sha256::digest(payload).into(),
    };

    let mut image = BytesMut::with_capacity(HEADER_LEN + payload.len());
    image.put_slice(&header.encode());
    image.put_slice(payload);
    Ok(image.freeze())
}
