// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The current wire codec, used once both peers have negotiated
//! `probe_version >= MIN_PROBE_VERSION_FOR_NEGOTIATION` (spec.md §4.1). Adds
//! the `probe_version_num` byte and the `ProtocolVersion` command on top of
//! the legacy layout.

use super::{header::DecodedHeader, wire, Codec, Error};

#[derive(Clone, Copy, Debug, Default)]
pub struct SdkCodec;

impl Codec for SdkCodec {
    fn encode(&self, header: &DecodedHeader, out: &mut [u8]) -> Result<usize, Error> {
        wire::encode(header, out, true)
    }

    fn decode(&self, input: &[u8]) -> Result<DecodedHeader, Error> {
        wire::decode(input, true)
    }
}
