//! Integration tests for the telelink-core frame pipeline.
//!
//! These tests push payload text through the full outbound path
//! (CryptoBox → Frame → codec) and back, the way a connection does.

use telelink_core::{
    decode_frame, encode_frame,
    protocol::payload::{decode_setup, decode_values, encode_setup, encode_values, SetupValues, Values},
    CryptoBox, Frame, Identity, MessageType,
};

fn identity() -> Identity {
    Identity::new("TL-ROUNDTRIP-001", b"k3y-k3y-k3y-k3y!", "127.0.0.1", 7000).unwrap()
}

/// Seals `plaintext`, frames it, encodes, decodes and opens it again.
fn roundtrip(kind: MessageType, tid: u16, plaintext: &[u8]) -> (Frame, Vec<u8>) {
    let id = identity();
    let crypto = CryptoBox::new();
    let sealed = crypto.encrypt(id.key(), plaintext).expect("encrypt");
    let frame = Frame::new(id.serial(), tid, kind, sealed.iv, sealed.ciphertext)
        .expect("frame")
        .with_health(1);

    let bytes = encode_frame(&frame).expect("encode");
    let (decoded, consumed) = decode_frame(&bytes).expect("complete frame");
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    assert_eq!(decoded, frame, "decoded frame must equal the original");

    let opened = crypto
        .decrypt(id.key(), &decoded.iv, &decoded.payload)
        .expect("decrypt");
    (decoded, opened)
}

#[test]
fn test_roundtrip_data_values() {
    let mut values = Values::new();
    values.insert("power".into(), Some(1250.5));
    values.insert("energy".into(), None);
    let text = encode_values(&values).unwrap();

    let (frame, opened) = roundtrip(MessageType::Data, 0x1234, &text);

    assert_eq!(frame.kind(), Ok(MessageType::Data));
    assert_eq!(frame.payload.len() % 8, 0);
    assert_eq!(decode_values(&opened).unwrap(), values);
}

#[test]
fn test_roundtrip_setup_values() {
    let mut setup = SetupValues::new();
    setup.insert("mode".into(), 2);
    setup.insert("limit".into(), -40);
    let text = encode_setup(&setup).unwrap();

    let (_, opened) = roundtrip(MessageType::Setup, 9, &text);

    assert_eq!(decode_setup(&opened).unwrap(), setup);
}

#[test]
fn test_roundtrip_keepalive_has_empty_payload() {
    let (frame, opened) = roundtrip(MessageType::Keepalive, 77, b"");
    assert!(frame.payload.is_empty());
    assert!(opened.is_empty());
    assert!(frame.ack);
}

#[test]
fn test_roundtrip_ack_sets_flag() {
    let (frame, _) = roundtrip(MessageType::Ack, u16::MAX, b"");
    assert!(frame.ack);
    assert_eq!(frame.transaction_id, u16::MAX);
}

#[test]
fn test_stream_of_frames_decodes_in_order() {
    // Arrange – three frames concatenated, as they would arrive on a socket
    let id = identity();
    let mut stream = Vec::new();
    for tid in [1u16, 2, 3] {
        let frame = Frame::new(id.serial(), tid, MessageType::Keepalive, [0; 8], Vec::new()).unwrap();
        stream.extend(encode_frame(&frame).unwrap());
    }

    // Act – drain the buffer the way a receiver does
    let mut seen = Vec::new();
    let mut offset = 0;
    while let Some((frame, used)) = decode_frame(&stream[offset..]) {
        seen.push(frame.transaction_id);
        offset += used;
    }

    // Assert
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(offset, stream.len());
}
