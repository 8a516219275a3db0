// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The decoded form of a probe control frame (spec.md §3, §6). Every codec
//! version decodes into this single struct; callers never see the wire
//! layout directly, matching the teacher's split between `packet::decoder`
//! output and the rest of the crate.

use crate::{gid::Gid, version::ProtocolVersion};

pub const MAX_IP_STR_LEN: usize = 64;
pub const MAX_STREAM_NAME_LEN: usize = 128;

/// Wire-level command tag (spec.md §3, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    any(test, feature = "testing"),
    derive(bolero_generator::TypeGenerator)
)]
pub enum Command {
    Reset,
    Ping,
    Connected,
    Ack,
    ProtocolVersion,
}

impl Command {
    #[inline]
    pub fn tag(self) -> u8 {
        match self {
            Self::Reset => 0,
            Self::Ping => 1,
            Self::Connected => 2,
            Self::Ack => 3,
            Self::ProtocolVersion => 4,
        }
    }

    #[inline]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Reset,
            1 => Self::Ping,
            2 => Self::Connected,
            3 => Self::Ack,
            4 => Self::ProtocolVersion,
            _ => return None,
        })
    }
}

/// Command-specific tail fields (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    any(test, feature = "testing"),
    derive(bolero_generator::TypeGenerator)
)]
pub enum Tail {
    /// `Reset` and `Ping` both carry a `requires_ack` flag.
    RequiresAck { requires_ack: bool },
    Ack {
        ack_command: Command,
        ack_control_packet_num: u16,
    },
    /// `Connected` and `ProtocolVersion` carry no extra fields.
    Empty,
}

/// A fully decoded probe header, independent of which codec produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedHeader {
    pub command: Command,
    pub sender_ip: String,
    pub sender_control_port: u16,
    pub sender_gid: Gid,
    pub sender_stream_name: String,
    pub sender_version: ProtocolVersion,
    pub control_packet_num: u16,
    pub tail: Tail,
}

impl DecodedHeader {
    /// Extracts the `(command, packet_num)` pair an `Ack` is acknowledging,
    /// if this header is in fact an `Ack`.
    #[inline]
    pub fn ack_target(&self) -> Option<(Command, u16)> {
        match (self.command, self.tail) {
            (
                Command::Ack,
                Tail::Ack {
                    ack_command,
                    ack_control_packet_num,
                },
            ) => Some((ack_command, ack_control_packet_num)),
            _ => None,
        }
    }

    #[inline]
    pub fn requires_ack(&self) -> bool {
        matches!(self.tail, Tail::RequiresAck { requires_ack: true })
    }
}
