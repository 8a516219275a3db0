// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The fabric identity ("GID" in the design doc, §3): a 16-byte opaque
//! value analogous to an L2 address. Layout mirrors the teacher's
//! `credentials::Id` (zerocopy, 16 bytes, `Deref<[u8; 16]>`), minus the
//! path-secret-specific `KeyId`/hashing this crate has no use for.

use core::fmt;
use std::ops::{Deref, DerefMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const GID_LEN: usize = 16;

#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, FromBytes, IntoBytes, Immutable, Unaligned, KnownLayout,
)]
#[cfg_attr(
    any(test, feature = "testing"),
    derive(bolero_generator::TypeGenerator)
)]
#[repr(C)]
pub struct Gid([u8; GID_LEN]);

impl Gid {
    pub const ZERO: Self = Self([0; GID_LEN]);

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Gid(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<[u8; GID_LEN]> for Gid {
    #[inline]
    fn from(v: [u8; GID_LEN]) -> Self {
        Self(v)
    }
}

impl Deref for Gid {
    type Target = [u8; GID_LEN];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Gid {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_on_default() {
        assert!(Gid::default().is_zero());
    }

    #[test]
    fn round_trips_through_bytes() {
        let bytes = [7u8; GID_LEN];
        let gid = Gid::from(bytes);
        assert_eq!(*gid, bytes);
        assert!(!gid.is_zero());
    }
}
