//! bgpd-proto -- wire codec, semantic validator and data model for BGP-4
//!
//! Structs here represent the *data*, not the on-wire format; the
//! [`component::Component`] trait and [`codec::MessageCodec`] handle moving
//! between the two. Only what RFC 4271 itself needs is implemented: no
//! MP-BGP, route refresh, graceful restart, or 4-byte ASN capability.

// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod component;
#[cfg(feature = "tokio-codec")]
pub mod codec;
pub mod notification;
pub mod path_attr;
pub mod prefix;
pub mod validate;

#[cfg(test)]
mod tests;

pub use notification::{ErrorCode, NotificationPayload};

use bytes::{Buf, BufMut};
use component::Component;
use path_attr::PathAttributes;
use prefix::PrefixList;
use std::net::Ipv4Addr;

/// Supported BGP version (RFC 4271 Section 4.2). Anything else is rejected.
pub const BGP_VERSION: u8 = 4;

/// BGP message header marker: 16 octets, all ones (RFC 4271 Section 4.1).
/// Authentication via the marker is not implemented (spec: Non-goals).
pub const MARKER: [u8; 16] = [0xff; 16];

/// Fixed header length in octets (marker + length + type).
pub const HEADER_LEN: usize = 19;

/// Minimum and maximum total message lengths (RFC 4271 Section 4.1).
pub const MIN_MESSAGE_LEN: usize = HEADER_LEN;
pub const MAX_MESSAGE_LEN: usize = 4096;
pub const MIN_OPEN_LEN: usize = 29;
pub const MIN_UPDATE_LEN: usize = 23;
pub const MIN_NOTIFICATION_LEN: usize = 21;

/// Errors raised while decoding or encoding BGP wire data.
///
/// This is distinct from [`NotificationPayload`]: these are framing/shape
/// errors raised by the codec layer, while a `NotificationPayload` is the
/// semantic validator's output, already shaped as `(code, subcode, data)`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid or missing marker")]
    Marker,
    #[error("message length {0} out of range")]
    MessageLength(usize),
    #[error("invalid message type {0}")]
    MessageType(u8),
    #[error("invalid length for {0} ({1:?} than expected)")]
    InternalLength(&'static str, std::cmp::Ordering),
    #[error("invalid {0} value {1}")]
    InternalType(&'static str, u16),
}

/// A decoded BGP message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    Keepalive,
}

impl Message {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Open(_) => MessageType::Open,
            Self::Update(_) => MessageType::Update,
            Self::Notification(_) => MessageType::Notification,
            Self::Keepalive => MessageType::Keepalive,
        }
    }

    /// Total on-wire length (header + body) this message would encode to.
    /// Used to re-derive the header's length field for validation after the
    /// codec has already consumed it.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Self::Open(open) => open.encoded_len(),
                Self::Update(update) => update.encoded_len(),
                Self::Notification(notification) => notification.encoded_len(),
                Self::Keepalive => 0,
            }
    }
}

/// BGP message type octet (RFC 4271 Section 4.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, enum_primitive_derive::Primitive)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

/// BGP OPEN message (RFC 4271 Section 4.2).
#[derive(Clone, Debug, PartialEq)]
pub struct Open {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_id: Ipv4Addr,
    pub opt_params: Vec<OptParam>,
}

impl Component for Open {
    fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error> {
        let version = src.get_u8();
        let asn = src.get_u16();
        let hold_time = src.get_u16();
        let bgp_id = Ipv4Addr::from_bytes(src)?;
        let opt_params_len = src.get_u8() as usize;
        if src.remaining() != opt_params_len {
            return Err(Error::InternalLength(
                "OPEN optional parameters length",
                std::cmp::Ordering::Equal,
            ));
        }
        let mut opt_params = Vec::new();
        while src.has_remaining() {
            opt_params.push(OptParam::from_bytes(src)?);
        }
        Ok(Self {
            version,
            asn,
            hold_time,
            bgp_id,
            opt_params,
        })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        len += self.version.to_bytes(dst);
        len += self.asn.to_bytes(dst);
        len += self.hold_time.to_bytes(dst);
        len += self.bgp_id.to_bytes(dst);
        let opt_params_len: usize = self.opt_params.iter().map(OptParam::encoded_len).sum();
        dst.put_u8(u8::try_from(opt_params_len).expect("optional parameters length overflow"));
        len += 1;
        for param in self.opt_params {
            len += param.to_bytes(dst);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        1 + 2
            + 2
            + 4
            + 1
            + self.opt_params.iter().map(OptParam::encoded_len).sum::<usize>()
    }
}

impl Open {
    #[must_use]
    pub fn new(asn: u16, hold_time: u16, bgp_id: Ipv4Addr, opt_params: Vec<OptParam>) -> Self {
        Self {
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_id,
            opt_params,
        }
    }
}

/// An OPEN message optional parameter (RFC 4271 Section 4.2).
///
/// The validator accepts the Authentication Information parameter (type 1)
/// without checking its contents (authentication was never implemented
/// upstream) and rejects every other parameter type, including the
/// Capabilities parameter (type 2, RFC 5492): capability negotiation is out
/// of scope.
#[derive(Clone, Debug, PartialEq)]
pub struct OptParam {
    pub param_type: u8,
    pub value: bytes::Bytes,
}

/// RFC 4271's now-obsolete Authentication Information parameter type.
pub const OPT_PARAM_AUTHENTICATION: u8 = 1;
/// RFC 5492 Capabilities Optional Parameter type.
pub const OPT_PARAM_CAPABILITIES: u8 = 2;

impl Component for OptParam {
    fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error> {
        let param_type = src.get_u8();
        let len = src.get_u8() as usize;
        if src.remaining() < len {
            return Err(Error::InternalLength(
                "optional parameter value",
                std::cmp::Ordering::Less,
            ));
        }
        let value = src.copy_to_bytes(len);
        Ok(Self { param_type, value })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self.param_type);
        dst.put_u8(u8::try_from(self.value.len()).expect("optional parameter length overflow"));
        dst.put_slice(&self.value);
        2 + self.value.len()
    }

    fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }
}

/// BGP UPDATE message (RFC 4271 Section 4.3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    pub withdrawn_routes: PrefixList,
    pub path_attrs: PathAttributes,
    pub nlri: PrefixList,
}

impl Component for Update {
    fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error> {
        let withdrawn_len = src.get_u16() as usize;
        if src.remaining() < withdrawn_len {
            return Err(Error::InternalLength(
                "withdrawn routes length",
                std::cmp::Ordering::Less,
            ));
        }
        let mut withdrawn_buf = src.split_to(withdrawn_len);
        let withdrawn_routes = PrefixList::from_bytes(&mut withdrawn_buf)?;
        let attrs_len = src.get_u16() as usize;
        if src.remaining() < attrs_len {
            return Err(Error::InternalLength(
                "total path attribute length",
                std::cmp::Ordering::Less,
            ));
        }
        let mut attrs_buf = src.split_to(attrs_len);
        let path_attrs = PathAttributes::from_bytes(&mut attrs_buf)?;
        let nlri = PrefixList::from_bytes(src)?;
        Ok(Self {
            withdrawn_routes,
            path_attrs,
            nlri,
        })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        let wdr_len_pos = dst.len();
        dst.put_u16(0);
        len += 2;
        let wdr_len = self.withdrawn_routes.to_bytes(dst);
        len += wdr_len;
        dst[wdr_len_pos..wdr_len_pos + 2]
            .copy_from_slice(&u16::try_from(wdr_len).expect("withdrawn routes length overflow").to_be_bytes());

        let attrs_len_pos = dst.len();
        dst.put_u16(0);
        len += 2;
        let attrs_len = self.path_attrs.to_bytes(dst);
        len += attrs_len;
        dst[attrs_len_pos..attrs_len_pos + 2]
            .copy_from_slice(&u16::try_from(attrs_len).expect("path attributes length overflow").to_be_bytes());

        len += self.nlri.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        2 + self.withdrawn_routes.encoded_len() + 2 + self.path_attrs.encoded_len() + self.nlri.encoded_len()
    }
}

impl Update {
    /// Length of the encoded withdrawn-routes field, as would appear in its
    /// own 16-bit length prefix.
    #[must_use]
    pub fn withdrawn_len(&self) -> usize {
        self.withdrawn_routes.encoded_len()
    }

    /// Length of the encoded total-path-attributes field, as would appear
    /// in its own 16-bit length prefix.
    #[must_use]
    pub fn attrs_len(&self) -> usize {
        self.path_attrs.encoded_len()
    }
}

/// BGP NOTIFICATION message (RFC 4271 Section 4.5).
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub payload: NotificationPayload,
}

impl Notification {
    #[must_use]
    pub const fn new(payload: NotificationPayload) -> Self {
        Self { payload }
    }
}

impl Component for Notification {
    fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error> {
        let code = src.get_u8();
        let subcode = src.get_u8();
        let data = src.copy_to_bytes(src.remaining());
        let code = ErrorCode::from_u8_checked(code)?;
        Ok(Self::new(NotificationPayload::new(code, subcode, data)))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self.payload.code as u8);
        dst.put_u8(self.payload.subcode);
        dst.put_slice(&self.payload.data);
        2 + self.payload.data.len()
    }

    fn encoded_len(&self) -> usize {
        2 + self.payload.data.len()
    }
}

impl ErrorCode {
    fn from_u8_checked(value: u8) -> Result<Self, Error> {
        use num_traits::FromPrimitive;
        Self::from_u8(value).ok_or(Error::InternalType("NOTIFICATION error code", u16::from(value)))
    }
}
