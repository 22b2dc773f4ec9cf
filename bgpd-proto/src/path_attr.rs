//! BGP path attributes (RFC 4271 Section 4.3 & 5).

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::component::Component;
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::net::Ipv4Addr;
use std::ops::Deref;

/// A full `path_attrs` TLV list as carried in an UPDATE message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathAttributes(pub Vec<PathAttribute>);

impl Component for PathAttributes {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut attrs = Vec::new();
        while src.has_remaining() {
            attrs.push(PathAttribute::from_bytes(src)?);
        }
        Ok(Self(attrs))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        for attr in self.0 {
            len += attr.to_bytes(dst);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(PathAttribute::encoded_len).sum()
    }
}

impl Deref for PathAttributes {
    type Target = Vec<PathAttribute>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PathAttributes {
    /// Look up the single attribute of `type_code`, if present.
    #[must_use]
    pub fn get(&self, type_code: u8) -> Option<&PathAttribute> {
        self.0.iter().find(|a| a.type_code() == type_code)
    }
}

/// A single path attribute: flags, type code, and either a recognized
/// decoded value or the raw bytes of an attribute this codec doesn't know.
#[derive(Clone, Debug, PartialEq)]
pub struct PathAttribute {
    pub flags: Flags,
    pub data: Data,
}

impl PathAttribute {
    #[must_use]
    pub fn type_code(&self) -> u8 {
        u8::from(&self.data)
    }
}

impl Component for PathAttribute {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let flags = Flags(src.get_u8());
        let type_code = src.get_u8();
        let len = if flags.is_extended_length() {
            src.get_u16() as usize
        } else {
            src.get_u8() as usize
        };
        if src.remaining() < len {
            return Err(Error::InternalLength(
                "path attribute value",
                std::cmp::Ordering::Less,
            ));
        }
        let mut value = src.split_to(len);
        let data = match Type::from_u8(type_code) {
            Some(Type::Origin) if value.remaining() == 1 => {
                Data::Origin(Origin::from_bytes(&mut value)?)
            }
            Some(Type::AsPath) => Data::AsPath(AsPath::from_bytes(&mut value)?),
            Some(Type::NextHop) if value.remaining() == 4 => {
                Data::NextHop(Ipv4Addr::from_bytes(&mut value)?)
            }
            Some(Type::MultiExitDisc) if value.remaining() == 4 => {
                Data::MultiExitDisc(value.get_u32())
            }
            Some(Type::LocalPref) if value.remaining() == 4 => {
                Data::LocalPref(value.get_u32())
            }
            Some(Type::AtomicAggregate) if value.is_empty() => Data::AtomicAggregate,
            Some(Type::Aggregator) if value.remaining() == 6 => {
                Data::Aggregator(Aggregator::from_bytes(&mut value)?)
            }
            // Length mismatches on otherwise-recognized well-known types are
            // surfaced to the validator as Unrecognized with the raw bytes
            // intact, so it can report ATTR_LENGTH with the offending value.
            _ => Data::Unrecognized(type_code, value),
        };
        Ok(Self { flags, data })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        dst.put_u8(self.flags.0);
        len += 1;
        let type_code = u8::from(&self.data);
        dst.put_u8(type_code);
        len += 1;
        let len_pos = dst.len();
        let two_byte_len = self.flags.is_extended_length();
        if two_byte_len {
            dst.put_u16(0);
            len += 2;
        } else {
            dst.put_u8(0);
            len += 1;
        }
        let data_len = match self.data {
            Data::Origin(origin) => origin.to_bytes(dst),
            Data::AsPath(as_path) => as_path.to_bytes(dst),
            Data::NextHop(next_hop) => next_hop.to_bytes(dst),
            Data::MultiExitDisc(med) => med.to_bytes(dst),
            Data::LocalPref(local_pref) => local_pref.to_bytes(dst),
            Data::AtomicAggregate => 0,
            Data::Aggregator(agg) => agg.to_bytes(dst),
            Data::Unrecognized(_, data) => {
                let n = data.len();
                dst.put_slice(&data);
                n
            }
        };
        if two_byte_len {
            dst[len_pos..len_pos + 2]
                .copy_from_slice(&u16::try_from(data_len).expect("attribute length overflow").to_be_bytes());
        } else {
            dst[len_pos] = u8::try_from(data_len).expect("attribute length overflow");
        }
        len + data_len
    }

    fn encoded_len(&self) -> usize {
        1 + 1
            + if self.flags.is_extended_length() { 2 } else { 1 }
            + match &self.data {
                Data::Origin(origin) => origin.encoded_len(),
                Data::AsPath(as_path) => as_path.encoded_len(),
                Data::NextHop(next_hop) => next_hop.encoded_len(),
                Data::MultiExitDisc(_) | Data::LocalPref(_) => 4,
                Data::AtomicAggregate => 0,
                Data::Aggregator(agg) => agg.encoded_len(),
                Data::Unrecognized(_, data) => data.len(),
            }
    }
}

/// Path attribute flags octet (RFC 4271 Section 4.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Flags(pub u8);

impl Flags {
    const OPTIONAL: u8 = 0b1000_0000;
    const TRANSITIVE: u8 = 0b0100_0000;
    const PARTIAL: u8 = 0b0010_0000;
    const EXTENDED_LENGTH: u8 = 0b0001_0000;

    #[must_use]
    pub const fn new(optional: bool, transitive: bool, partial: bool, extended_length: bool) -> Self {
        let mut bits = 0u8;
        if optional {
            bits |= Self::OPTIONAL;
        }
        if transitive {
            bits |= Self::TRANSITIVE;
        }
        if partial {
            bits |= Self::PARTIAL;
        }
        if extended_length {
            bits |= Self::EXTENDED_LENGTH;
        }
        Self(bits)
    }

    #[must_use]
    pub const fn is_optional(self) -> bool {
        self.0 & Self::OPTIONAL != 0
    }

    #[must_use]
    pub const fn is_transitive(self) -> bool {
        self.0 & Self::TRANSITIVE != 0
    }

    #[must_use]
    pub const fn is_partial(self) -> bool {
        self.0 & Self::PARTIAL != 0
    }

    #[must_use]
    pub const fn is_extended_length(self) -> bool {
        self.0 & Self::EXTENDED_LENGTH != 0
    }
}

/// Decoded (or passed-through) value of a path attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    /// Any type code not decoded above, including well-known types whose
    /// length didn't match what RFC 4271 prescribes (the validator is
    /// responsible for turning that into an `ATTR_LENGTH` error).
    Unrecognized(u8, Bytes),
}

impl From<&Data> for u8 {
    fn from(data: &Data) -> u8 {
        match data {
            Data::Origin(_) => Type::Origin as u8,
            Data::AsPath(_) => Type::AsPath as u8,
            Data::NextHop(_) => Type::NextHop as u8,
            Data::MultiExitDisc(_) => Type::MultiExitDisc as u8,
            Data::LocalPref(_) => Type::LocalPref as u8,
            Data::AtomicAggregate => Type::AtomicAggregate as u8,
            Data::Aggregator(_) => Type::Aggregator as u8,
            Data::Unrecognized(type_code, _) => *type_code,
        }
    }
}

/// Well-known path attribute type codes (RFC 4271 Section 5).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum Type {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
}

/// ORIGIN attribute value (RFC 4271 Section 5.1.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl Component for Origin {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let value = src.get_u8();
        Self::from_u8(value).ok_or(Error::InternalType("origin", u16::from(value)))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self as u8);
        1
    }

    fn encoded_len(&self) -> usize {
        1
    }
}

/// AS_PATH attribute value: an ordered sequence of SET/SEQUENCE segments
/// (RFC 4271 Section 4.3, 5.1.2).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsPath(pub Vec<AsSegment>);

impl Component for AsPath {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut segments = Vec::new();
        while src.has_remaining() {
            segments.push(AsSegment::from_bytes(src)?);
        }
        Ok(Self(segments))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        for segment in self.0 {
            len += segment.to_bytes(dst);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(AsSegment::encoded_len).sum()
    }
}

impl Deref for AsPath {
    type Target = Vec<AsSegment>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsPath {
    /// Number of ASNs this path carries toward the best-path length
    /// tie-break: SEQUENCE segments count every ASN, a SET counts as one
    /// hop regardless of its member count (spec: best-path tie-break #2).
    #[must_use]
    pub fn path_length(&self) -> usize {
        self.0
            .iter()
            .map(|seg| match seg.type_ {
                AsSegmentType::AsSequence => seg.asns.len(),
                AsSegmentType::AsSet => 1,
            })
            .sum()
    }

    /// The leftmost ASN of the path, used to scope MED comparison to paths
    /// learned from the same neighboring AS (spec: best-path tie-break #4).
    #[must_use]
    pub fn first_asn(&self) -> Option<u16> {
        self.0.first().and_then(|seg| seg.asns.first().copied())
    }

    /// Does this AS_PATH contain `asn` anywhere (used for loop detection)?
    #[must_use]
    pub fn contains(&self, asn: u16) -> bool {
        self.0.iter().any(|seg| seg.asns.contains(&asn))
    }

    /// Prepend `asn` onto the path as the new speaker would when
    /// re-advertising to an eBGP peer.
    ///
    /// If the first segment is a SEQUENCE, the ASN is prepended into it; if
    /// it's a SET, a new single-ASN SEQUENCE segment is inserted in front;
    /// if the path is empty, a new single-ASN SEQUENCE segment is created.
    pub fn prepend(&mut self, asn: u16) {
        match self.0.first_mut() {
            Some(seg) if seg.type_ == AsSegmentType::AsSequence => {
                seg.asns.insert(0, asn);
            }
            _ => {
                self.0.insert(
                    0,
                    AsSegment {
                        type_: AsSegmentType::AsSequence,
                        asns: vec![asn],
                    },
                );
            }
        }
    }
}

/// One AS_PATH segment (RFC 4271 Section 4.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsSegment {
    pub type_: AsSegmentType,
    pub asns: Vec<u16>,
}

/// AS_PATH segment type. Only SET and SEQUENCE are legal on the wire; any
/// other value is a malformed AS_PATH (spec: validator table, AS_PATH row).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum AsSegmentType {
    AsSet = 1,
    AsSequence = 2,
}

impl Component for AsSegment {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let type_code = src.get_u8();
        let count = src.get_u8() as usize;
        if src.remaining() < count * 2 {
            return Err(Error::InternalLength(
                "AS_PATH segment",
                std::cmp::Ordering::Less,
            ));
        }
        let type_ = AsSegmentType::from_u8(type_code)
            .ok_or(Error::InternalType("AS_PATH segment type", u16::from(type_code)))?;
        let mut asns = Vec::with_capacity(count);
        for _ in 0..count {
            asns.push(src.get_u16());
        }
        Ok(Self { type_, asns })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self.type_ as u8);
        dst.put_u8(u8::try_from(self.asns.len()).expect("AS_PATH segment too long"));
        for asn in &self.asns {
            dst.put_u16(*asn);
        }
        2 + self.asns.len() * 2
    }

    fn encoded_len(&self) -> usize {
        2 + self.asns.len() * 2
    }
}

/// AGGREGATOR attribute value (RFC 4271 Section 5.1.7): the ASN and BGP
/// identifier of the router that formed an aggregate route.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Aggregator {
    pub asn: u16,
    pub speaker: Ipv4Addr,
}

impl Component for Aggregator {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let asn = src.get_u16();
        let speaker = Ipv4Addr::from_bytes(src)?;
        Ok(Self { asn, speaker })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u16(self.asn);
        self.speaker.to_bytes(dst);
        6
    }

    fn encoded_len(&self) -> usize {
        6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn as_path_prepend_into_leading_sequence() {
        let mut path = AsPath(vec![AsSegment {
            type_: AsSegmentType::AsSequence,
            asns: vec![65002, 65003],
        }]);
        path.prepend(65001);
        assert_eq!(path.0[0].asns, vec![65001, 65002, 65003]);
        assert_eq!(path.path_length(), 3);
    }

    #[test]
    fn as_path_prepend_before_leading_set() {
        let mut path = AsPath(vec![AsSegment {
            type_: AsSegmentType::AsSet,
            asns: vec![65002, 65003],
        }]);
        path.prepend(65001);
        assert_eq!(path.0.len(), 2);
        assert_eq!(path.0[0].type_, AsSegmentType::AsSequence);
        assert_eq!(path.0[0].asns, vec![65001]);
        // a SET counts as one hop regardless of membership
        assert_eq!(path.path_length(), 2);
    }

    #[test]
    fn as_path_prepend_onto_empty_path() {
        let mut path = AsPath::default();
        path.prepend(65001);
        assert_eq!(path.0.len(), 1);
        assert_eq!(path.0[0].type_, AsSegmentType::AsSequence);
        assert_eq!(path.0[0].asns, vec![65001]);
    }

    #[test]
    fn round_trips_origin_attribute() {
        let attr = PathAttribute {
            flags: Flags::new(false, true, false, false),
            data: Data::Origin(Origin::Igp),
        };
        let mut buf = BytesMut::new();
        attr.clone().to_bytes(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = PathAttribute::from_bytes(&mut bytes).unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn round_trips_as_path_with_two_segments() {
        let path = AsPath(vec![
            AsSegment {
                type_: AsSegmentType::AsSequence,
                asns: vec![65001, 65002],
            },
            AsSegment {
                type_: AsSegmentType::AsSet,
                asns: vec![65003],
            },
        ]);
        let attr = PathAttribute {
            flags: Flags::new(false, true, false, false),
            data: Data::AsPath(path.clone()),
        };
        let mut buf = BytesMut::new();
        attr.to_bytes(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = PathAttribute::from_bytes(&mut bytes).unwrap();
        assert_eq!(decoded.data, Data::AsPath(path));
    }

    #[test]
    fn unrecognized_type_round_trips_raw_bytes() {
        let attr = PathAttribute {
            flags: Flags::new(true, true, false, false),
            data: Data::Unrecognized(200, Bytes::from_static(&[1, 2, 3])),
        };
        let mut buf = BytesMut::new();
        attr.clone().to_bytes(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = PathAttribute::from_bytes(&mut bytes).unwrap();
        assert_eq!(decoded, attr);
    }
}
