// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
    Unaligned,
};

use crate::errors::FrameError;

/// Literal frame magic.
pub const MAGIC: [u8; 3] = *b"DNY";

/// Bytes covered by the length field before the payload starts:
/// physical id (4) + message id (2) + command (1) + checksum (2).
pub const MIN_BODY_LEN: u16 = 9;

/// Fixed bytes before the payload: magic (3) + length (2) + the 7 body bytes
/// preceding the payload.
pub const PREFIX_LEN: usize = 12;

/// The pre-registration link heartbeat, echoed back verbatim.
pub const LINK_HEARTBEAT: &[u8] = b"link";

const ICCID_MIN_LEN: usize = 15;
const ICCID_MAX_LEN: usize = 22;

/// Wire layout of everything before the payload. All multibyte fields are
/// little-endian.
#[repr(C)]
#[derive(Debug, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FramePrefix {
    pub magic: [u8; 3],
    pub length: U16<LittleEndian>,
    pub physical_id: U32<LittleEndian>,
    pub message_id: U16<LittleEndian>,
    pub command: u8,
}

/// One decoded DNY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnyFrame {
    pub physical_id: u32,
    pub message_id: u16,
    pub command: u8,
    pub payload: Bytes,
}

impl DnyFrame {
    pub fn new(
        physical_id: u32,
        message_id: u16,
        command: u8,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            physical_id,
            message_id,
            command,
            payload: payload.into(),
        }
    }

    /// Device id as the control plane sees it: the physical id rendered as
    /// eight uppercase hex digits, big-endian.
    pub fn device_id(&self) -> String {
        format!("{:08X}", self.physical_id)
    }

    /// The ACK for this frame: same ids and command, single status byte 0x00.
    pub fn ack(&self) -> DnyFrame {
        DnyFrame::new(
            self.physical_id,
            self.message_id,
            self.command,
            Bytes::from_static(&[0x00]),
        )
    }

    /// Serializes the frame, computing the length and checksum fields.
    pub fn encode(&self) -> Bytes {
        let length = self.payload.len() as u16 + MIN_BODY_LEN;
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + self.payload.len() + 2);

        let prefix = FramePrefix {
            magic: MAGIC,
            length: U16::new(length),
            physical_id: U32::new(self.physical_id),
            message_id: U16::new(self.message_id),
            command: self.command,
        };
        buf.put_slice(prefix.as_bytes());
        buf.put_slice(&self.payload);

        let sum = checksum(&buf);
        buf.put_u16_le(sum);
        buf.freeze()
    }

    /// Parses one complete standard frame.
    ///
    /// The slice must hold exactly one frame; the scanner is responsible for
    /// finding that boundary in the TCP stream.
    pub fn decode(buf: &[u8]) -> Result<DnyFrame, FrameError> {
        if buf.len() < 3 {
            return Err(FrameError::ShortFrame {
                need: 3,
                got: buf.len(),
            });
        }
        if buf[..3] != MAGIC {
            let mut magic = [0u8; 3];
            magic.copy_from_slice(&buf[..3]);
            return Err(FrameError::BadMagic(magic));
        }
        if buf.len() < PREFIX_LEN + 2 {
            return Err(FrameError::ShortFrame {
                need: PREFIX_LEN + 2,
                got: buf.len(),
            });
        }

        let (prefix, rest) = FramePrefix::ref_from_prefix(buf)
            .map_err(|_| FrameError::ShortFrame {
                need: PREFIX_LEN,
                got: buf.len(),
            })?;

        let length = prefix.length.get() as usize;
        if length < MIN_BODY_LEN as usize {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual: buf.len().saturating_sub(5),
            });
        }
        // Length counts everything after itself, checksum included.
        let total = 5 + length;
        if buf.len() != total {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual: buf.len() - 5,
            });
        }

        let payload_len = length - MIN_BODY_LEN as usize;
        let payload = &rest[..payload_len];

        let computed = checksum(&buf[..total - 2]);
        let found = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
        if computed != found {
            return Err(FrameError::ChecksumMismatch { computed, found });
        }

        Ok(DnyFrame {
            physical_id: prefix.physical_id.get(),
            message_id: prefix.message_id.get(),
            command: prefix.command,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Sum of all bytes before the checksum, truncated to 16 bits.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

/// One classified inbound message: either a standard frame or one of the two
/// unframed pre-registration side channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnyMessage {
    /// Bare SIM identifier sent before registration.
    Iccid(String),
    /// Literal `"link"` keep-alive.
    HeartbeatLink,
    /// A checksum-verified DNY frame.
    Standard(DnyFrame),
}

/// Classifies one extracted message.
pub fn classify(buf: &[u8]) -> Result<DnyMessage, FrameError> {
    if buf.len() >= 3 && buf[..3] == MAGIC {
        return Ok(DnyMessage::Standard(DnyFrame::decode(buf)?));
    }
    if buf == LINK_HEARTBEAT {
        return Ok(DnyMessage::HeartbeatLink);
    }
    // ICCIDs are hex-ish, e.g. "898604D9102380488339".
    if !buf.is_empty() && buf.iter().all(|b| b.is_ascii_hexdigit()) {
        if (ICCID_MIN_LEN..=ICCID_MAX_LEN).contains(&buf.len()) {
            // Validated as pure ASCII above.
            let iccid = String::from_utf8_lossy(buf).into_owned();
            return Ok(DnyMessage::Iccid(iccid));
        }
        warn!(len = buf.len(), "iccid-like message outside 15..=22 bytes");
    }

    if buf.len() < 3 {
        return Err(FrameError::ShortFrame {
            need: 3,
            got: buf.len(),
        });
    }
    let mut magic = [0u8; 3];
    magic.copy_from_slice(&buf[..3]);
    Err(FrameError::BadMagic(magic))
}
