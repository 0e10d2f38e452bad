// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Frame-level failures produced by the DNY codec.
///
/// These never tear down a connection by themselves: the dispatcher logs the
/// reason and drops the offending bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad magic: expected \"DNY\", got {0:02x?}")]
    BadMagic([u8; 3]),

    #[error("short frame: need {need} bytes, got {got}")]
    ShortFrame { need: usize, got: usize },

    #[error("length mismatch: header says {declared}, buffer carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: computed {computed:#06x}, frame says {found:#06x}")]
    ChecksumMismatch { computed: u16, found: u16 },
}

/// Failure taxonomy of the gateway core.
///
/// Returned as values through `Result`; the HTTP collaborator maps them onto
/// its `{code, message, data}` envelope.
#[derive(Error, Debug)]
pub enum GatewayError {
    // -- input --
    #[error("nil connection handle")]
    NilConnection,

    #[error("empty device id")]
    EmptyDeviceId,

    #[error("empty iccid")]
    EmptyIccid,

    #[error("bad hex data: {0}")]
    BadHexData(#[from] hex::FromHexError),

    // -- lookup --
    #[error("connection {0} not found")]
    ConnectionNotFound(u64),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("device group {0} not found")]
    GroupNotFound(String),

    // -- frame --
    #[error(transparent)]
    Frame(#[from] FrameError),

    // -- command --
    #[error("command {command:#04x} to device {device_id} timed out after {timeout_secs}s")]
    CommandTimeout {
        device_id: String,
        command: u8,
        timeout_secs: u64,
    },

    #[error("write to connection {0} failed")]
    WriteFailed(u64),

    // -- index --
    #[error("device index for {0} is inconsistent and could not be repaired")]
    IndexInconsistent(String),

    // -- lifecycle --
    #[error("background tasks already running")]
    AlreadyRunning,

    #[error("background tasks not running")]
    NotRunning,

    #[error("capacity limit reached ({0})")]
    TooManyConnections(usize),
}
