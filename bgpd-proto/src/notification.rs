//! BGP NOTIFICATION error codes and subcodes (RFC 4271 Section 4.5 & 6).

// SPDX-License-Identifier: AGPL-3.0-or-later

use bytes::Bytes;
use enum_primitive_derive::Primitive;

/// Top-level NOTIFICATION error code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

/// Message Header Error subcodes (RFC 4271 Section 6.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

/// OPEN Message Error subcodes (RFC 4271 Section 6.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
}

/// UPDATE Message Error subcodes (RFC 4271 Section 6.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    AsRoutingLoop = 7,
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// Cease subcodes (RFC 4271 Section 8.1 / RFC 4486).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum CeaseSubcode {
    MaximumNumberOfPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
}

/// A validated or self-raised protocol error, in the exact shape a
/// NOTIFICATION message carries: `(code, subcode, data)`.
///
/// `data` holds the offending attribute/scalar serialized back to bytes,
/// or is empty when RFC 4271 prescribes no data (e.g. header sync errors).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationPayload {
    pub code: ErrorCode,
    pub subcode: u8,
    pub data: Bytes,
}

impl NotificationPayload {
    #[must_use]
    pub const fn new(code: ErrorCode, subcode: u8, data: Bytes) -> Self {
        Self {
            code,
            subcode,
            data,
        }
    }

    #[must_use]
    pub const fn empty(code: ErrorCode, subcode: u8) -> Self {
        Self::new(code, subcode, Bytes::new())
    }
}

impl std::fmt::Display for NotificationPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}/{:?}", self.code, self.subcode, self.data)
    }
}
