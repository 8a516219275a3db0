// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The probe wire codec (C1). Two concrete codecs exist, `sdk` (current
//! wire layout, probe version >= 3) and `legacy` (v1, no
//! `probe_version_num` byte and no `ProtocolVersion` command), selected per
//! spec.md §4.1. Both implement the same `Codec` trait so the state machine
//! can hold `&dyn Codec` without caring which wire layout is in play —
//! mirroring how the teacher keeps packet encode/decode behind a
//! `EncoderValue`/decoder-value pair per wire type rather than branching on
//! version inline at every call site.

pub mod header;
mod legacy;
mod sdk;
mod wire;

pub use header::{Command, DecodedHeader, Tail};
pub use legacy::LegacyCodec;
pub use sdk::SdkCodec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("frame shorter than the minimum header size")]
    Truncated,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unrecognized command tag")]
    UnknownCommand,
    #[error("string field is not valid UTF-8 or is not null-terminated")]
    InvalidString,
    #[error("encoded frame would exceed the output buffer")]
    BufferTooSmall,
}

/// Common behavior of every probe wire codec.
pub trait Codec {
    /// Encodes `header` into `out`, returning the number of bytes written.
    fn encode(&self, header: &DecodedHeader, out: &mut [u8]) -> Result<usize, Error>;

    /// Decodes a header from `input`. Rejects frames whose checksum does not
    /// match with `Error::ChecksumMismatch` (spec.md §4.1).
    fn decode(&self, input: &[u8]) -> Result<DecodedHeader, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gid::Gid, version::ProtocolVersion};

    pub(crate) fn sample_header(command: Command, tail: Tail) -> DecodedHeader {
        DecodedHeader {
            command,
            sender_ip: "192.0.2.10".into(),
            sender_control_port: 47593,
            sender_gid: Gid::from([7u8; 16]),
            sender_stream_name: "camera-0".into(),
            sender_version: ProtocolVersion::CURRENT,
            control_packet_num: 42,
            tail,
        }
    }

    #[test]
    fn sdk_round_trips_reset() {
        let codec = SdkCodec;
        let header = sample_header(
            Command::Reset,
            Tail::RequiresAck { requires_ack: true },
        );
        let mut buf = [0u8; header::MAX_STREAM_NAME_LEN + header::MAX_IP_STR_LEN + 64];
        let len = codec.encode(&header, &mut buf).unwrap();
        let decoded = codec.decode(&buf[..len]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn sdk_round_trips_ack() {
        let codec = SdkCodec;
        let header = sample_header(
            Command::Ack,
            Tail::Ack {
                ack_command: Command::Ping,
                ack_control_packet_num: 0xFFFF,
            },
        );
        let mut buf = [0u8; 256];
        let len = codec.encode(&header, &mut buf).unwrap();
        let decoded = codec.decode(&buf[..len]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn legacy_round_trips_and_omits_probe_version() {
        let codec = LegacyCodec;
        let mut header = sample_header(
            Command::Ping,
            Tail::RequiresAck { requires_ack: false },
        );
        // the legacy wire layout has no slot for probe_version, so a round
        // trip through it always normalizes to 0 regardless of what was set
        header.sender_version.probe_version = 0;
        let mut buf = [0u8; 256];
        let len = codec.encode(&header, &mut buf).unwrap();
        let decoded = codec.decode(&buf[..len]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn legacy_rejects_protocol_version_command() {
        let codec = LegacyCodec;
        let header = sample_header(Command::ProtocolVersion, Tail::Empty);
        let mut buf = [0u8; 256];
        assert!(codec.encode(&header, &mut buf).is_err());
    }

    #[test]
    fn decode_rejects_corrupted_checksum() {
        let codec = SdkCodec;
        let header = sample_header(
            Command::Reset,
            Tail::RequiresAck { requires_ack: true },
        );
        let mut buf = [0u8; 256];
        let len = codec.encode(&header, &mut buf).unwrap();
        buf[len - 1] ^= 0xFF;
        assert_eq!(codec.decode(&buf[..len]), Err(Error::ChecksumMismatch));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let codec = SdkCodec;
        assert_eq!(codec.decode(&[0u8; 4]), Err(Error::Truncated));
    }

    #[test]
    fn packet_num_wraps_and_still_round_trips() {
        let codec = SdkCodec;
        for packet_num in [0xFFFEu16, 0xFFFF, 0x0000, 0x0001] {
            let mut header = sample_header(
                Command::Reset,
                Tail::RequiresAck { requires_ack: true },
            );
            header.control_packet_num = packet_num;
            let mut buf = [0u8; 256];
            let len = codec.encode(&header, &mut buf).unwrap();
            let decoded = codec.decode(&buf[..len]).unwrap();
            assert_eq!(decoded.control_packet_num, packet_num);
        }
    }

    /// Every `(Command, Tail, control_packet_num)` the codec accepts must
    /// round-trip unchanged, independent of the fixed string/gid/version
    /// fields `sample_header` supplies. The string fields are exercised
    /// separately by `write_cstr`'s own length check, so they're held
    /// constant here rather than generated (an arbitrary `String` would
    /// routinely exceed `MAX_STREAM_NAME_LEN` and only prove the bounds
    /// check works, not the round trip).
    #[test]
    fn sdk_round_trips_every_generated_command_and_tail() {
        let codec = SdkCodec;
        bolero::check!()
            .with_type::<(Command, Tail, u16)>()
            .for_each(|&(command, tail, control_packet_num)| {
                // ProtocolVersion/Connected carry `Tail::Empty`; Reset/Ping
                // carry `RequiresAck`; Ack carries `Tail::Ack`. Generated
                // combinations outside that pairing aren't reachable through
                // normal encode/decode use and are skipped rather than
                // asserted on.
                let tail_matches_command = matches!(
                    (command, tail),
                    (Command::Reset | Command::Ping, Tail::RequiresAck { .. })
                        | (Command::Ack, Tail::Ack { .. })
                        | (Command::Connected | Command::ProtocolVersion, Tail::Empty)
                );
                if !tail_matches_command {
                    return;
                }

                let mut header = sample_header(command, tail);
                header.control_packet_num = control_packet_num;
                let mut buf = [0u8; 256];
                let len = codec.encode(&header, &mut buf).expect("fixed-size fields always fit");
                let decoded = codec.decode(&buf[..len]).unwrap();
                assert_eq!(decoded, header);
            });
    }
}
