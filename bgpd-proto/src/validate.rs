//! Semantic validation of decoded BGP messages (RFC 4271 Section 6).
//!
//! Every check here returns a [`NotificationPayload`] carrying
//! `(code, subcode, data)` on failure, exactly what the peer FSM sends back
//! on the wire before tearing the session down. Validation halts at the
//! first failure.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::component::Component;
use crate::notification::{ErrorCode, HeaderErrorSubcode, OpenErrorSubcode, UpdateErrorSubcode};
use crate::path_attr::{Data, Flags};
use crate::{
    Error, NotificationPayload, Open, Update, HEADER_LEN, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN,
    MIN_NOTIFICATION_LEN, MIN_OPEN_LEN, MIN_UPDATE_LEN, OPT_PARAM_AUTHENTICATION, BGP_VERSION,
};
use bytes::{Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Header validation order: marker, length, type (spec Section 4.2).
///
/// The codec ([`crate::codec::MessageCodec`]) already refuses to produce a
/// `Message` unless a syntactically valid header was present, so this
/// function exists to translate a codec-level [`Error`] into the
/// NOTIFICATION payload the FSM must send, preserving that same order.
#[must_use]
pub fn header_error(err: &Error) -> NotificationPayload {
    match err {
        Error::Marker => {
            NotificationPayload::empty(ErrorCode::Header, HeaderErrorSubcode::ConnectionNotSynchronized as u8)
        }
        Error::MessageLength(len) => NotificationPayload::new(
            ErrorCode::Header,
            HeaderErrorSubcode::BadMessageLength as u8,
            Bytes::copy_from_slice(&u16::try_from(*len).unwrap_or(u16::MAX).to_be_bytes()),
        ),
        Error::MessageType(t) => NotificationPayload::new(
            ErrorCode::Header,
            HeaderErrorSubcode::BadMessageType as u8,
            Bytes::copy_from_slice(&[*t]),
        ),
        _ => NotificationPayload::empty(ErrorCode::Header, HeaderErrorSubcode::BadMessageLength as u8),
    }
}

/// Checks the declared total message length against the type-specific
/// minimum and the global maximum (spec Section 4.1).
pub fn message_length(msg_type: crate::MessageType, total_len: usize) -> Result<(), NotificationPayload> {
    let min = match msg_type {
        crate::MessageType::Open => MIN_OPEN_LEN,
        crate::MessageType::Update => MIN_UPDATE_LEN,
        crate::MessageType::Notification => MIN_NOTIFICATION_LEN,
        crate::MessageType::Keepalive => HEADER_LEN,
    };
    if total_len < min || total_len > MAX_MESSAGE_LEN || total_len < MIN_MESSAGE_LEN {
        return Err(NotificationPayload::new(
            ErrorCode::Header,
            HeaderErrorSubcode::BadMessageLength as u8,
            Bytes::copy_from_slice(&u16::try_from(total_len).unwrap_or(u16::MAX).to_be_bytes()),
        ));
    }
    Ok(())
}

/// Validates a decoded OPEN message against this speaker's expectations for
/// the peer it was received from.
///
/// Order: version, peer ASN match, hold-time, BGP identifier match,
/// optional parameters (spec Section 4.2).
pub fn open(open: &Open, expected_peer_asn: u16, expected_bgp_id: Ipv4Addr) -> Result<(), NotificationPayload> {
    if open.version != BGP_VERSION {
        return Err(NotificationPayload::new(
            ErrorCode::Open,
            OpenErrorSubcode::UnsupportedVersionNumber as u8,
            Bytes::copy_from_slice(&[open.version]),
        ));
    }
    if open.asn != expected_peer_asn {
        return Err(NotificationPayload::new(
            ErrorCode::Open,
            OpenErrorSubcode::BadPeerAs as u8,
            Bytes::copy_from_slice(&open.asn.to_be_bytes()),
        ));
    }
    if open.hold_time != 0 && open.hold_time < 3 {
        return Err(NotificationPayload::new(
            ErrorCode::Open,
            OpenErrorSubcode::UnacceptableHoldTime as u8,
            Bytes::copy_from_slice(&open.hold_time.to_be_bytes()),
        ));
    }
    if open.bgp_id != expected_bgp_id {
        return Err(NotificationPayload::new(
            ErrorCode::Open,
            OpenErrorSubcode::BadBgpIdentifier as u8,
            Bytes::copy_from_slice(&open.bgp_id.octets()),
        ));
    }
    for param in &open.opt_params {
        if param.param_type != OPT_PARAM_AUTHENTICATION {
            let mut data = BytesMut::new();
            param.clone().to_bytes(&mut data);
            return Err(NotificationPayload::new(
                ErrorCode::Open,
                OpenErrorSubcode::UnsupportedOptionalParameter as u8,
                data.freeze(),
            ));
        }
    }
    Ok(())
}

/// Required well-known attributes an UPDATE carrying new NLRI must have.
const REQUIRED_ATTR_TYPES: [u8; 3] = [
    crate::path_attr::Type::Origin as u8,
    crate::path_attr::Type::AsPath as u8,
    crate::path_attr::Type::NextHop as u8,
];

/// Validates a decoded UPDATE message.
///
/// Order: length consistency, per-attribute validation, required-attribute
/// presence (spec Section 4.2).
pub fn update(
    raw_update_len: usize,
    withdrawn_len: usize,
    attrs_len: usize,
    update: &Update,
    local_asn: u16,
) -> Result<(), NotificationPayload> {
    length_consistency(raw_update_len, withdrawn_len, attrs_len)?;

    let mut seen_types = Vec::new();
    for attr in update.path_attrs.iter() {
        let type_code = attr.type_code();
        if seen_types.contains(&type_code) {
            return Err(duplicate_attribute_error(attr));
        }
        seen_types.push(type_code);
        validate_attribute(attr, local_asn)?;
    }

    if !update.nlri.is_empty() {
        for required in REQUIRED_ATTR_TYPES {
            if !seen_types.contains(&required) {
                return Err(NotificationPayload::empty(
                    ErrorCode::Update,
                    UpdateErrorSubcode::MissingWellKnownAttribute as u8,
                ));
            }
        }
    }
    Ok(())
}

/// spec Section 9, open question: reject UPDATEs whose declared lengths
/// can't possibly fit in the outer message, using `ATTR_LIST` since the
/// source never implemented the narrower cross-check RFC 4271 describes.
fn length_consistency(raw_update_len: usize, withdrawn_len: usize, attrs_len: usize) -> Result<(), NotificationPayload> {
    if MIN_UPDATE_LEN + withdrawn_len + attrs_len > raw_update_len {
        return Err(NotificationPayload::empty(
            ErrorCode::Update,
            UpdateErrorSubcode::MalformedAttributeList as u8,
        ));
    }
    Ok(())
}

fn duplicate_attribute_error(attr: &crate::path_attr::PathAttribute) -> NotificationPayload {
    let mut data = BytesMut::new();
    attr.clone().to_bytes(&mut data);
    NotificationPayload::new(ErrorCode::Update, UpdateErrorSubcode::MalformedAttributeList as u8, data.freeze())
}

fn validate_attribute(attr: &crate::path_attr::PathAttribute, local_asn: u16) -> Result<(), NotificationPayload> {
    match &attr.data {
        Data::Origin(_) => expect_flags(attr, false, true),
        Data::AsPath(as_path) => {
            expect_flags(attr, false, true)?;
            if as_path.contains(local_asn) {
                return Err(attr_error(attr, UpdateErrorSubcode::AsRoutingLoop, false));
            }
            Ok(())
        }
        Data::NextHop(addr) => {
            expect_flags(attr, false, true)?;
            if *addr == Ipv4Addr::UNSPECIFIED {
                return Err(attr_error(attr, UpdateErrorSubcode::InvalidNextHopAttribute, true));
            }
            Ok(())
        }
        Data::MultiExitDisc(_) => expect_flags(attr, true, false),
        Data::LocalPref(_) => expect_flags(attr, false, true),
        Data::AtomicAggregate => expect_flags(attr, false, true),
        Data::Aggregator(_) => expect_flags(attr, true, true),
        Data::Unrecognized(type_code, _) => {
            if is_well_known_type(*type_code) {
                // Recognized type, but the decoder couldn't parse its value
                // (wrong length): report as an attribute length error.
                Err(attr_error_raw(attr, UpdateErrorSubcode::AttributeLengthError))
            } else if !attr.flags.is_optional() {
                Err(attr_error_raw(attr, UpdateErrorSubcode::UnrecognizedWellKnownAttribute))
            } else {
                Ok(())
            }
        }
    }
}

fn is_well_known_type(type_code: u8) -> bool {
    use crate::path_attr::Type;
    use num_traits::FromPrimitive;
    matches!(
        Type::from_u8(type_code),
        Some(Type::Origin | Type::MultiExitDisc | Type::LocalPref | Type::AtomicAggregate | Type::Aggregator)
    )
}

fn expect_flags(attr: &crate::path_attr::PathAttribute, optional: bool, transitive: bool) -> Result<(), NotificationPayload> {
    if attr.flags.is_optional() != optional || attr.flags.is_transitive() != transitive {
        return Err(attr_error_raw(attr, UpdateErrorSubcode::AttributeFlagsError));
    }
    Ok(())
}

fn attr_error(attr: &crate::path_attr::PathAttribute, subcode: UpdateErrorSubcode, with_data: bool) -> NotificationPayload {
    if with_data {
        attr_error_raw(attr, subcode)
    } else {
        NotificationPayload::empty(ErrorCode::Update, subcode as u8)
    }
}

fn attr_error_raw(attr: &crate::path_attr::PathAttribute, subcode: UpdateErrorSubcode) -> NotificationPayload {
    let mut data = BytesMut::new();
    attr.clone().to_bytes(&mut data);
    NotificationPayload::new(ErrorCode::Update, subcode as u8, data.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_attr::{AsPath, AsSegment, AsSegmentType, PathAttribute};
    use crate::{OptParam, MessageType};

    fn open_fixture(asn: u16, hold: u16, id: &str, opt: Vec<OptParam>) -> Open {
        Open::new(asn, hold, id.parse().unwrap(), opt)
    }

    #[test]
    fn accepts_matching_open() {
        let o = open_fixture(65001, 90, "192.0.2.1", vec![]);
        assert!(open(&o, 65001, "192.0.2.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn rejects_bad_version() {
        let mut o = open_fixture(65001, 90, "192.0.2.1", vec![]);
        o.version = 3;
        let err = open(&o, 65001, "192.0.2.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Open);
        assert_eq!(err.subcode, OpenErrorSubcode::UnsupportedVersionNumber as u8);
    }

    #[test]
    fn rejects_mismatched_peer_asn() {
        let o = open_fixture(65002, 90, "192.0.2.1", vec![]);
        let err = open(&o, 65001, "192.0.2.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.subcode, OpenErrorSubcode::BadPeerAs as u8);
    }

    #[test]
    fn rejects_short_hold_time() {
        let o = open_fixture(65001, 2, "192.0.2.1", vec![]);
        let err = open(&o, 65001, "192.0.2.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.subcode, OpenErrorSubcode::UnacceptableHoldTime as u8);
    }

    #[test]
    fn zero_hold_time_is_acceptable() {
        let o = open_fixture(65001, 0, "192.0.2.1", vec![]);
        assert!(open(&o, 65001, "192.0.2.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn rejects_capabilities_optional_parameter() {
        let o = open_fixture(
            65001,
            90,
            "192.0.2.1",
            vec![OptParam {
                param_type: crate::OPT_PARAM_CAPABILITIES,
                value: Bytes::new(),
            }],
        );
        let err = open(&o, 65001, "192.0.2.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.subcode, OpenErrorSubcode::UnsupportedOptionalParameter as u8);
    }

    #[test]
    fn accepts_authentication_optional_parameter_unverified() {
        let o = open_fixture(
            65001,
            90,
            "192.0.2.1",
            vec![OptParam {
                param_type: OPT_PARAM_AUTHENTICATION,
                value: Bytes::from_static(&[0xde, 0xad]),
            }],
        );
        assert!(open(&o, 65001, "192.0.2.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn detects_as_path_loop() {
        let update = Update {
            withdrawn_routes: Default::default(),
            path_attrs: crate::path_attr::PathAttributes(vec![
                PathAttribute {
                    flags: Flags::new(false, true, false, false),
                    data: Data::Origin(crate::path_attr::Origin::Igp),
                },
                PathAttribute {
                    flags: Flags::new(false, true, false, false),
                    data: Data::AsPath(AsPath(vec![AsSegment {
                        type_: AsSegmentType::AsSequence,
                        asns: vec![65001, 65000],
                    }])),
                },
                PathAttribute {
                    flags: Flags::new(false, true, false, false),
                    data: Data::NextHop("192.0.2.1".parse().unwrap()),
                },
            ]),
            nlri: Default::default(),
        };
        let err = super::update(100, 0, 0, &update, 65000).unwrap_err();
        assert_eq!(err.code, ErrorCode::Update);
        assert_eq!(err.subcode, UpdateErrorSubcode::AsRoutingLoop as u8);
    }

    #[test]
    fn message_length_rejects_undersized_update() {
        let err = message_length(MessageType::Update, 10).unwrap_err();
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength as u8);
    }

    #[test]
    fn message_length_accepts_minimum_keepalive() {
        assert!(message_length(MessageType::Keepalive, HEADER_LEN).is_ok());
    }
}
