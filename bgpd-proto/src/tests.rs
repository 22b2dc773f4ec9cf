//! Fixture-driven tests exercising the scenarios spec'd against raw wire
//! bytes, independent of the per-module unit tests.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::component::Component;
use crate::prefix::Prefix;
use crate::validate;
use crate::{Open, BGP_VERSION};
use bytes::{BufMut, BytesMut};

/// Parse a hex dump into bytes, ignoring whitespace and `:` separators.
fn hex_to_bytes(hex: &str) -> bytes::Bytes {
    let digits: Vec<u8> = hex
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .map(|b| (b as char).to_digit(16).expect("invalid hex digit") as u8)
        .collect();
    assert_eq!(digits.len() % 2, 0, "odd number of hex digits");
    let mut out = BytesMut::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        out.put_u8((pair[0] << 4) | pair[1]);
    }
    out.freeze()
}

/// S1 — OPEN message round trip and marker-corruption rejection.
#[test]
fn s1_open_message_body_round_trip() {
    // OPEN body only (no header): version, ASN 65001, hold 90,
    // BGP ID 192.0.2.1, zero-length optional parameters.
    let body = hex_to_bytes("04 FDE9 005A C0000201 00");
    let mut bytes = body.clone();
    let open = Open::from_bytes(&mut bytes).unwrap();
    assert_eq!(open.version, BGP_VERSION);
    assert_eq!(open.asn, 65001);
    assert_eq!(open.hold_time, 90);
    assert_eq!(open.bgp_id, "192.0.2.1".parse().unwrap());
    assert!(open.opt_params.is_empty());

    assert!(validate::open(&open, 65001, "192.0.2.1".parse().unwrap()).is_ok());

    let mut encoded = BytesMut::new();
    open.to_bytes(&mut encoded);
    assert_eq!(encoded.freeze(), body);
}

#[cfg(feature = "tokio-codec")]
#[test]
fn s1_corrupted_marker_is_a_header_sync_error() {
    use crate::codec::MessageCodec;
    use crate::notification::HeaderErrorSubcode;
    use crate::{Error, ErrorCode, Message};
    use tokio_util::codec::{Decoder, Encoder};

    let mut codec = MessageCodec;
    let mut buf = BytesMut::new();
    let open = Open::new(65001, 90, "192.0.2.1".parse().unwrap(), vec![]);
    codec.encode(Message::Open(open), &mut buf).unwrap();
    buf[0] = 0x00; // corrupt one marker byte
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, Error::Marker));
    let payload = validate::header_error(&err);
    assert_eq!(payload.code, ErrorCode::Header);
    assert_eq!(payload.subcode, HeaderErrorSubcode::ConnectionNotSynchronized as u8);
    assert!(payload.data.is_empty());
}

/// S6 — prefix codec fixed examples.
#[test]
fn s6_prefix_codec_fixtures() {
    let cases = [
        (24u8, "10.0.1.0", "18 0A 00 01"),
        (20, "172.16.0.0", "14 AC 10 00"),
    ];
    for (len, addr, hex) in cases {
        let prefix = Prefix::new(len, addr.parse().unwrap());
        let mut buf = BytesMut::new();
        prefix.to_bytes(&mut buf);
        assert_eq!(buf.freeze(), hex_to_bytes(hex));

        let mut decode_buf = hex_to_bytes(hex);
        let decoded = Prefix::from_bytes(&mut decode_buf).unwrap();
        assert_eq!(decoded, prefix);
    }
}

