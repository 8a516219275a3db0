// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared wire-layout plumbing used by both the `sdk` and `legacy` codecs:
//! the ones-complement checksum, bounded null-terminated string fields, and
//! the byte layout common to both versions (spec.md §6). The only
//! difference between the two codecs is whether the `probe_version_num`
//! byte is present and whether `ProtocolVersion` is a legal command, which
//! is why both call into the same `encode`/`decode` here with a
//! `has_probe_version` flag rather than duplicating the byte-twiddling.

use super::{
    header::{Command, DecodedHeader, Tail, MAX_IP_STR_LEN, MAX_STREAM_NAME_LEN},
    Error,
};
use crate::gid::{Gid, GID_LEN};

const CHECKSUM_LEN: usize = 2;
const PORT_LEN: usize = 2;
const PACKET_NUM_LEN: usize = 2;

/// Internet-style ones-complement checksum, computed with the checksum
/// field itself treated as zero.
pub(super) fn checksum(frame: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = frame.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn write_cstr(out: &mut [u8], field_len: usize, s: &str) -> Result<(), Error> {
    let bytes = s.as_bytes();
    if bytes.len() + 1 > field_len {
        return Err(Error::InvalidString);
    }
    let field = &mut out[..field_len];
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_cstr(input: &[u8]) -> Result<String, Error> {
    let end = input.iter().position(|&b| b == 0).unwrap_or(input.len());
    core::str::from_utf8(&input[..end])
        .map(str::to_owned)
        .map_err(|_| Error::InvalidString)
}

#[inline]
fn advance<'a>(buf: &mut &'a mut [u8], len: usize) -> Result<&'a mut [u8], Error> {
    if buf.len() < len {
        return Err(Error::BufferTooSmall);
    }
    let taken = core::mem::take(buf);
    let (head, tail) = taken.split_at_mut(len);
    *buf = tail;
    Ok(head)
}

#[inline]
fn advance_ref<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    if buf.len() < len {
        return Err(Error::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

pub(super) fn min_len(has_probe_version: bool) -> usize {
    CHECKSUM_LEN
        + 2
        + has_probe_version as usize
        + 1 // command
        + PACKET_NUM_LEN
        + MAX_IP_STR_LEN
        + PORT_LEN
        + GID_LEN
        + MAX_STREAM_NAME_LEN
        + 1 // minimum tail (RequiresAck / Empty)
}

pub(super) fn encode(
    header: &DecodedHeader,
    out: &mut [u8],
    has_probe_version: bool,
) -> Result<usize, Error> {
    if !has_probe_version && header.command == Command::ProtocolVersion {
        return Err(Error::InvalidString);
    }

    let total = min_len(has_probe_version)
        + match header.tail {
            Tail::Ack { .. } => 2,
            _ => 0,
        };

    if out.len() < total {
        return Err(Error::BufferTooSmall);
    }
    let frame = &mut out[..total];

    {
        let mut cursor: &mut [u8] = frame;
        advance(&mut cursor, CHECKSUM_LEN)?; // checksum written last
        advance(&mut cursor, 1)?[0] = header.sender_version.version;
        advance(&mut cursor, 1)?[0] = header.sender_version.major;
        if has_probe_version {
            advance(&mut cursor, 1)?[0] = header.sender_version.probe_version;
        }
        advance(&mut cursor, 1)?[0] = header.command.tag();
        advance(&mut cursor, PACKET_NUM_LEN)?
            .copy_from_slice(&header.control_packet_num.to_be_bytes());
        write_cstr(
            advance(&mut cursor, MAX_IP_STR_LEN)?,
            MAX_IP_STR_LEN,
            &header.sender_ip,
        )?;
        advance(&mut cursor, PORT_LEN)?
            .copy_from_slice(&header.sender_control_port.to_be_bytes());
        advance(&mut cursor, GID_LEN)?.copy_from_slice(&*header.sender_gid);
        write_cstr(
            advance(&mut cursor, MAX_STREAM_NAME_LEN)?,
            MAX_STREAM_NAME_LEN,
            &header.sender_stream_name,
        )?;

        match header.tail {
            Tail::RequiresAck { requires_ack } => {
                advance(&mut cursor, 1)?[0] = requires_ack as u8;
            }
            Tail::Ack {
                ack_command,
                ack_control_packet_num,
            } => {
                advance(&mut cursor, 1)?[0] = ack_command.tag();
                advance(&mut cursor, 2)?.copy_from_slice(&ack_control_packet_num.to_be_bytes());
            }
            Tail::Empty => {
                advance(&mut cursor, 1)?[0] = 0;
            }
        }
    }

    frame[0..2].fill(0);
    let sum = checksum(frame);
    frame[0..2].copy_from_slice(&sum.to_be_bytes());

    Ok(total)
}

pub(super) fn decode(input: &[u8], has_probe_version: bool) -> Result<DecodedHeader, Error> {
    if input.len() < min_len(has_probe_version) - 1 {
        return Err(Error::Truncated);
    }

    {
        let mut check_buf = [0u8; 2];
        check_buf.copy_from_slice(&input[0..2]);
        let mut zeroed = input.to_vec();
        zeroed[0..2].fill(0);
        let expected = checksum(&zeroed);
        if expected != u16::from_be_bytes(check_buf) {
            return Err(Error::ChecksumMismatch);
        }
    }

    let mut cursor: &[u8] = input;
    advance_ref(&mut cursor, CHECKSUM_LEN)?;
    let version = advance_ref(&mut cursor, 1)?[0];
    let major = advance_ref(&mut cursor, 1)?[0];
    let probe_version = if has_probe_version {
        advance_ref(&mut cursor, 1)?[0]
    } else {
        0
    };
    let command_tag = advance_ref(&mut cursor, 1)?[0];
    let command = Command::from_tag(command_tag).ok_or(Error::UnknownCommand)?;
    if !has_probe_version && command == Command::ProtocolVersion {
        return Err(Error::UnknownCommand);
    }
    let control_packet_num =
        u16::from_be_bytes(advance_ref(&mut cursor, PACKET_NUM_LEN)?.try_into().unwrap());
    let sender_ip = read_cstr(advance_ref(&mut cursor, MAX_IP_STR_LEN)?)?;
    let sender_control_port =
        u16::from_be_bytes(advance_ref(&mut cursor, PORT_LEN)?.try_into().unwrap());
    let mut gid = [0u8; GID_LEN];
    gid.copy_from_slice(advance_ref(&mut cursor, GID_LEN)?);
    let sender_stream_name = read_cstr(advance_ref(&mut cursor, MAX_STREAM_NAME_LEN)?)?;

    let tail = match command {
        Command::Reset | Command::Ping => Tail::RequiresAck {
            requires_ack: advance_ref(&mut cursor, 1)?[0] != 0,
        },
        Command::Ack => {
            let ack_command =
                Command::from_tag(advance_ref(&mut cursor, 1)?[0]).ok_or(Error::UnknownCommand)?;
            let ack_control_packet_num =
                u16::from_be_bytes(advance_ref(&mut cursor, 2)?.try_into().unwrap());
            Tail::Ack {
                ack_command,
                ack_control_packet_num,
            }
        }
        Command::Connected | Command::ProtocolVersion => {
            advance_ref(&mut cursor, 1)?;
            Tail::Empty
        }
    };

    Ok(DecodedHeader {
        command,
        sender_ip,
        sender_control_port,
        sender_gid: Gid::from(gid),
        sender_stream_name,
        sender_version: crate::version::ProtocolVersion {
            version,
            major,
            probe_version,
        },
        control_packet_num,
        tail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_zeroed_buffer_is_all_ones() {
        assert_eq!(checksum(&[0u8; 8]), 0xFFFF);
    }

    #[test]
    fn checksum_changes_with_content() {
        assert_ne!(checksum(&[1u8; 8]), checksum(&[2u8; 8]));
    }
}
