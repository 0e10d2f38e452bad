// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use dny_gateway_rs::{
    codec::frame::{DnyFrame, DnyMessage, classify, checksum},
    errors::FrameError,
};
use hex_literal::hex;

#[test]
fn encodes_power_heartbeat_ack_exactly() {
    // (physical 0x04A228CD, message 2, command 0x06, payload [0x00])
    let wire = DnyFrame::new(0x04A2_28CD, 2, 0x06, vec![0x00]).encode();
    let expected = hex!("44 4E 59 0A 00 CD 28 A2 04 02 00 06 00 98 02");
    assert_eq!(&wire[..], &expected[..]);
}

#[test]
fn round_trips_registration_frame() {
    let frame = DnyFrame::new(0x04A2_28CD, 1, 0x20, b"V1.05\0\0".to_vec());
    let wire = frame.encode();

    let decoded = DnyFrame::decode(&wire).expect("decode");
    assert_eq!(decoded, frame);
    assert_eq!(decoded.device_id(), "04A228CD");

    // encode(decode(x)) == x
    assert_eq!(decoded.encode(), wire);
}

#[test]
fn length_nine_means_empty_payload() {
    let wire = DnyFrame::new(1, 1, 0x81, Bytes::new()).encode();
    assert_eq!(u16::from_le_bytes([wire[3], wire[4]]), 9);
    let decoded = DnyFrame::decode(&wire).expect("decode");
    assert!(decoded.payload.is_empty());
}

#[test]
fn rejects_bad_magic() {
    let err = DnyFrame::decode(b"XNY\x09\x00123456789").expect_err("bad magic");
    assert!(matches!(err, FrameError::BadMagic(_)));
}

#[test]
fn rejects_short_frame() {
    let err = DnyFrame::decode(b"DNY\x09").expect_err("short");
    assert!(matches!(err, FrameError::ShortFrame { .. }));
}

#[test]
fn rejects_length_mismatch() {
    let mut wire = DnyFrame::new(1, 1, 0x06, vec![0x00]).encode().to_vec();
    // Declare one byte more than the buffer carries.
    wire[3] += 1;
    let err = DnyFrame::decode(&wire).expect_err("length mismatch");
    assert!(matches!(err, FrameError::LengthMismatch { .. }));
}

#[test]
fn rejects_checksum_mismatch() {
    let mut wire = DnyFrame::new(1, 1, 0x06, vec![0x00]).encode().to_vec();
    let last = wire.len() - 1;
    wire[last] ^= 0xFF;
    let err = DnyFrame::decode(&wire).expect_err("checksum mismatch");
    assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
}

#[test]
fn ack_mirrors_ids_with_status_byte() {
    let frame = DnyFrame::new(0x1122_3344, 77, 0x21, vec![0x05, 0x06]);
    let ack = frame.ack();
    assert_eq!(ack.physical_id, frame.physical_id);
    assert_eq!(ack.message_id, frame.message_id);
    assert_eq!(ack.command, frame.command);
    assert_eq!(&ack.payload[..], &[0x00]);
}

#[test]
fn classifies_iccid_link_and_standard() {
    assert_eq!(
        classify(b"898604D9102380488339").expect("iccid"),
        DnyMessage::Iccid("898604D9102380488339".to_string())
    );
    assert_eq!(classify(b"link").expect("link"), DnyMessage::HeartbeatLink);

    let wire = DnyFrame::new(1, 1, 0x06, vec![0x00]).encode();
    assert!(matches!(
        classify(&wire).expect("standard"),
        DnyMessage::Standard(_)
    ));
}

#[test]
fn iccid_outside_length_bounds_is_rejected() {
    // 14 digits: one short of a minimal ICCID.
    assert!(classify(b"89860412345678").is_err());
    // 23 digits: one past the maximum.
    assert!(classify(b"89860412345678901234567").is_err());
}

#[test]
fn checksum_covers_everything_before_it() {
    let wire = DnyFrame::new(0xDEAD_BEEF, 0xFFFF, 0xFE, vec![0xAA; 16]).encode();
    let body = &wire[..wire.len() - 2];
    let found = u16::from_le_bytes([wire[wire.len() - 2], wire[wire.len() - 1]]);
    assert_eq!(checksum(body), found);
}
