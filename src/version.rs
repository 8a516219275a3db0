// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! Protocol-version negotiation types (spec.md §3, §4.1).

use crate::config::{MIN_PROBE_VERSION_FOR_FAST_PING, MIN_PROBE_VERSION_FOR_NEGOTIATION};

/// `{version, major, probe_version}` as carried in every decoded header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    any(test, feature = "testing"),
    derive(bolero_generator::TypeGenerator)
)]
pub struct ProtocolVersion {
    pub version: u8,
    pub major: u8,
    pub probe_version: u8,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self {
        version: 1,
        major: 0,
        probe_version: 5,
    };

    /// Probe version >= 3 enables the `ProtocolVersion` command; versions
    /// below that must use the legacy v1 codec exclusively.
    #[inline]
    pub fn supports_negotiation(&self) -> bool {
        self.probe_version >= MIN_PROBE_VERSION_FOR_NEGOTIATION
    }

    /// Probe version >= 5 shortens the ping period.
    #[inline]
    pub fn supports_fast_ping(&self) -> bool {
        self.probe_version >= MIN_PROBE_VERSION_FOR_FAST_PING
    }

    #[inline]
    pub fn is_legacy(&self) -> bool {
        !self.supports_negotiation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_peer_forces_legacy_codec() {
        let v = ProtocolVersion {
            version: 1,
            major: 0,
            probe_version: 2,
        };
        assert!(v.is_legacy());
        assert!(!v.supports_negotiation());
        assert!(!v.supports_fast_ping());
    }

    #[test]
    fn current_supports_everything() {
        assert!(ProtocolVersion::CURRENT.supports_negotiation());
        assert!(ProtocolVersion::CURRENT.supports_fast_ping());
    }
}
