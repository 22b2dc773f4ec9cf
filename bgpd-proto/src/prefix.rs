//! NLRI / withdrawn-routes prefix codec (RFC 4271 Section 4.3).
//!
//! A prefix on the wire is one length-in-bits octet followed by
//! `ceil(length / 8)` octets of address, right-padded with zero bits in the
//! final octet. This module carries IPv4 prefixes only: MP-BGP/IPv6 NLRI is
//! out of scope.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::component::Component;
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use std::net::Ipv4Addr;
use std::ops::Deref;

/// Number of octets needed to carry `prefix_len` bits.
fn octets_for_len(prefix_len: u8) -> usize {
    usize::from((prefix_len + 7) / 8)
}

/// A single `(length_bits, address)` prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Prefix {
    pub prefix_len: u8,
    pub addr: Ipv4Addr,
}

impl Prefix {
    /// Construct a prefix, masking off any host bits beyond `prefix_len` so
    /// that encoding is canonical.
    ///
    /// # Panics
    /// Panics if `prefix_len` exceeds 32.
    #[must_use]
    pub fn new(prefix_len: u8, addr: Ipv4Addr) -> Self {
        assert!(prefix_len <= 32, "IPv4 prefix length must be <= 32");
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        };
        let addr = Ipv4Addr::from(u32::from(addr) & mask);
        Self { prefix_len, addr }
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Component for Prefix {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let prefix_len = src.get_u8();
        if prefix_len > 32 {
            return Err(Error::InternalLength(
                "prefix length",
                std::cmp::Ordering::Greater,
            ));
        }
        let n = octets_for_len(prefix_len);
        if src.remaining() < n {
            return Err(Error::InternalLength(
                "prefix address",
                std::cmp::Ordering::Less,
            ));
        }
        let mut octets = [0u8; 4];
        octets[..n].copy_from_slice(&src.copy_to_bytes(n));
        Ok(Self::new(prefix_len, Ipv4Addr::from(octets)))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let n = octets_for_len(self.prefix_len);
        dst.put_u8(self.prefix_len);
        dst.put_slice(&self.addr.octets()[..n]);
        1 + n
    }

    fn encoded_len(&self) -> usize {
        1 + octets_for_len(self.prefix_len)
    }
}

/// A compact list of prefixes with no overall length field (the caller knows
/// how many bytes belong to the list, e.g. from a preceding 16-bit length).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrefixList(pub Vec<Prefix>);

impl Component for PrefixList {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut prefixes = Vec::new();
        while src.has_remaining() {
            prefixes.push(Prefix::from_bytes(src)?);
        }
        Ok(Self(prefixes))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        for prefix in self.0 {
            len += prefix.to_bytes(dst);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(Prefix::encoded_len).sum()
    }
}

impl Deref for PrefixList {
    type Target = Vec<Prefix>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<Prefix> for PrefixList {
    fn from_iter<I: IntoIterator<Item = Prefix>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn encodes_24_bit_prefix() {
        let p = Prefix::new(24, "10.0.1.0".parse().unwrap());
        let mut buf = BytesMut::new();
        p.to_bytes(&mut buf);
        assert_eq!(&buf[..], &[0x18, 0x0A, 0x00, 0x01]);
    }

    #[test]
    fn encodes_20_bit_prefix() {
        let p = Prefix::new(20, "172.16.0.0".parse().unwrap());
        let mut buf = BytesMut::new();
        p.to_bytes(&mut buf);
        assert_eq!(&buf[..], &[0x14, 0xAC, 0x10, 0x00]);
    }

    #[test]
    fn decode_is_inverse_of_encode() {
        for (len, addr) in [
            (24u8, "10.0.1.0"),
            (20, "172.16.0.0"),
            (0, "0.0.0.0"),
            (32, "192.0.2.1"),
            (17, "10.20.128.0"),
        ] {
            let p = Prefix::new(len, addr.parse().unwrap());
            let mut buf = BytesMut::new();
            p.to_bytes(&mut buf);
            let mut bytes = buf.freeze();
            let decoded = Prefix::from_bytes(&mut bytes).unwrap();
            assert_eq!(decoded, p);
            assert!(!bytes.has_remaining());
        }
    }

    #[test]
    fn rejects_oversized_prefix_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(33);
        let mut bytes = buf.freeze();
        assert!(Prefix::from_bytes(&mut bytes).is_err());
    }
}
