// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::frame::{LINK_HEARTBEAT, MAGIC};

const ICCID_MIN_LEN: usize = 15;

/// Splits one complete message off the front of the read buffer.
///
/// Returns `None` when the buffer holds only a prefix of a message and more
/// bytes are needed. Unrecognizable leading bytes are returned as a single
/// message so the dispatcher can log and drop them; the connection survives.
pub fn extract_message(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }

    if MAGIC.starts_with(&buf[..buf.len().min(3)]) {
        return extract_standard(buf);
    }
    if LINK_HEARTBEAT.starts_with(&buf[..buf.len().min(4)]) {
        if buf.len() < 4 {
            return None;
        }
        return Some(buf.split_to(4).freeze());
    }
    if buf[0].is_ascii_hexdigit() {
        return extract_iccid_run(buf);
    }

    // Garbage: hand the whole chunk to the classifier, which will reject it.
    Some(buf.split_to(buf.len()).freeze())
}

fn extract_standard(buf: &mut BytesMut) -> Option<Bytes> {
    // Magic (3) + length (2) tell us the full frame size.
    if buf.len() < 5 {
        return None;
    }
    let length = u16::from_le_bytes([buf[3], buf[4]]) as usize;
    let total = 5 + length;
    if buf.len() < total {
        return None;
    }
    Some(buf.split_to(total).freeze())
}

/// Finds the end of a bare ICCID run. The next DNY magic or link heartbeat
/// terminates the run; a run that fills the whole buffer but is still shorter
/// than a minimal ICCID waits for more bytes.
fn extract_iccid_run(buf: &mut BytesMut) -> Option<Bytes> {
    let mut end = 0usize;
    while end < buf.len() {
        let rest = &buf[end..];
        if rest.starts_with(&MAGIC) || rest.starts_with(LINK_HEARTBEAT) {
            break;
        }
        // A trailing "D"/"DN" may be the start of the next frame's magic.
        if MAGIC.starts_with(rest) || LINK_HEARTBEAT.starts_with(rest) {
            return None;
        }
        if !buf[end].is_ascii_hexdigit() {
            break;
        }
        end += 1;
    }

    if end == buf.len() && end < ICCID_MIN_LEN {
        // The run may still be growing.
        return None;
    }
    if end == 0 {
        // First byte no longer continues a run; emit it as garbage.
        return Some(buf.split_to(1).freeze());
    }
    Some(buf.split_to(end).freeze())
}

/// Drops leading bytes the peer may send between messages.
pub fn skip_noise(buf: &mut BytesMut) {
    while !buf.is_empty() && (buf[0] == b'\r' || buf[0] == b'\n' || buf[0] == 0) {
        buf.advance(1);
    }
}
