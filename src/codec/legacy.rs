// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The v1 wire codec, used with peers that never advertise
//! `probe_version_num` at all (spec.md §4.1). Same layout as `sdk` minus the
//! `probe_version_num` byte; `ProtocolVersion` is not a representable
//! command on this wire, so encoding one fails rather than silently
//! dropping the field.

use super::{header::DecodedHeader, wire, Codec, Error};

#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyCodec;

impl Codec for LegacyCodec {
    fn encode(&self, header: &DecodedHeader, out: &mut [u8]) -> Result<usize, Error> {
        wire::encode(header, out, false)
    }

    fn decode(&self, input: &[u8]) -> Result<DecodedHeader, Error> {
        wire::decode(input, false)
    }
}
