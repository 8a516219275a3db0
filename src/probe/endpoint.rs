// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-direction probe endpoint (spec.md §3). Holds everything the FSM
//! needs to decide its next move: the state value, the pending/deferred ack
//! records, the negotiated codec, and the counters the retry budgets in
//! spec.md §7/§8 are checked against.

use super::state::ProbeState;
use crate::{
    codec::{Command, LegacyCodec, SdkCodec},
    config::ProbeConfig,
    gid::Gid,
    version::ProtocolVersion,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Tracks the single outstanding ack this endpoint expects, guarded by a
/// lock held only across the compare-and-update (spec.md §5).
#[derive(Clone, Copy, Debug, Default)]
pub struct PendingAck {
    pub is_pending: bool,
    pub command: Option<Command>,
    pub packet_num: u16,
}

/// Holds a reset ack that must be sent only once our own reset completes
/// (spec.md §3, scenario 5 in §8).
#[derive(Clone, Copy, Debug, Default)]
pub struct DeferredAck {
    pub valid: bool,
    pub command: Option<Command>,
    pub packet_num: u16,
    pub remote_probe_version: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Sdk,
    Legacy,
}

#[derive(Clone, Copy, Debug)]
pub struct Negotiated {
    pub codec: CodecKind,
    pub peer_version: ProtocolVersion,
}

pub struct ProbeEndpoint {
    pub direction: Direction,
    pub local_gid: Gid,
    pub config: ProbeConfig,
    state: Mutex<ProbeState>,
    remote_gid: Mutex<Gid>,
    control_packet_num: AtomicU16,
    pending_ack: Mutex<PendingAck>,
    deferred_ack: Mutex<DeferredAck>,
    negotiated: Mutex<Option<Negotiated>>,
    send_retries: AtomicU32,
    ack_retries: AtomicU32,
    probe_completions: AtomicUsize,
    last_ping_at: Mutex<Option<crate::clock::Timestamp>>,
    pub sdk_codec: SdkCodec,
    pub legacy_codec: LegacyCodec,
}

impl ProbeEndpoint {
    pub fn new(direction: Direction, local_gid: Gid, config: ProbeConfig) -> Self {
        Self {
            direction,
            local_gid,
            config,
            state: Mutex::new(ProbeState::initial(direction)),
            remote_gid: Mutex::new(Gid::ZERO),
            control_packet_num: AtomicU16::new(1),
            pending_ack: Mutex::new(PendingAck::default()),
            deferred_ack: Mutex::new(DeferredAck::default()),
            negotiated: Mutex::new(None),
            send_retries: AtomicU32::new(0),
            ack_retries: AtomicU32::new(0),
            probe_completions: AtomicUsize::new(0),
            last_ping_at: Mutex::new(None),
            sdk_codec: SdkCodec,
            legacy_codec: LegacyCodec,
        }
    }

    #[inline]
    pub fn state(&self) -> ProbeState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: ProbeState) {
        let mut current = self.state.lock();
        tracing::debug!(direction = ?self.direction, prev = ?*current, next = ?next, "probe state transition");
        *current = next;
    }

    /// Allocates the next `control_packet_num`, wrapping `0xFFFF -> 0x0000`
    /// per spec.md §6/§8.
    #[inline]
    pub fn next_packet_num(&self) -> u16 {
        self.control_packet_num.fetch_add(1, Ordering::Relaxed)
    }

    pub fn remote_gid(&self) -> Gid {
        *self.remote_gid.lock()
    }

    /// Clears the remote GID; called on every reset request (spec.md §3
    /// invariants: "cleared on every reset request").
    pub fn clear_remote_gid(&self) {
        *self.remote_gid.lock() = Gid::ZERO;
    }

    pub fn set_remote_gid(&self, gid: Gid) {
        *self.remote_gid.lock() = gid;
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        *self.negotiated.lock()
    }

    pub fn set_negotiated(&self, codec: CodecKind, peer_version: ProtocolVersion) {
        *self.negotiated.lock() = Some(Negotiated {
            codec,
            peer_version,
        });
    }

    /// Destroys the negotiated codec on reset — "destroy negotiated codec"
    /// per the `SendReset` row of the send-side transition table.
    pub fn clear_negotiated(&self) {
        *self.negotiated.lock() = None;
    }

    pub fn record_pending(&self, command: Command, packet_num: u16) {
        let mut pending = self.pending_ack.lock();
        pending.is_pending = true;
        pending.command = Some(command);
        pending.packet_num = packet_num;
    }

    /// The ack compare-and-update: accepts only if `(command, packet_num)`
    /// matches the recorded pending record and `is_pending` is set,
    /// clearing it on success (spec.md §3 invariant, §8 "ack mismatch").
    pub fn take_pending_if_matches(&self, command: Command, packet_num: u16) -> bool {
        let mut pending = self.pending_ack.lock();
        if pending.is_pending && pending.command == Some(command) && pending.packet_num == packet_num {
            pending.is_pending = false;
            true
        } else {
            false
        }
    }

    pub fn is_ack_pending(&self) -> bool {
        self.pending_ack.lock().is_pending
    }

    pub fn set_deferred(&self, command: Command, packet_num: u16, remote_probe_version: u8) {
        let mut deferred = self.deferred_ack.lock();
        deferred.valid = true;
        deferred.command = Some(command);
        deferred.packet_num = packet_num;
        deferred.remote_probe_version = remote_probe_version;
    }

    /// Drains the deferred ack slot, if any. Only `ResetDone` processing
    /// calls this (spec.md §8 scenario 5).
    pub fn take_deferred(&self) -> Option<DeferredAck> {
        let mut deferred = self.deferred_ack.lock();
        if deferred.valid {
            deferred.valid = false;
            Some(*deferred)
        } else {
            None
        }
    }

    pub fn send_retries(&self) -> u32 {
        self.send_retries.load(Ordering::Relaxed)
    }

    pub fn bump_send_retries(&self) -> u32 {
        self.send_retries.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_send_retries(&self) {
        self.send_retries.store(0, Ordering::Relaxed);
    }

    pub fn ack_retries(&self) -> u32 {
        self.ack_retries.load(Ordering::Relaxed)
    }

    pub fn bump_ack_retries(&self) -> u32 {
        self.ack_retries.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_ack_retries(&self) {
        self.ack_retries.store(0, Ordering::Relaxed);
    }

    pub fn probe_completions(&self) -> usize {
        self.probe_completions.load(Ordering::Relaxed)
    }

    pub fn bump_probe_completions(&self) -> usize {
        self.probe_completions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_probe_completions(&self) {
        self.probe_completions.store(0, Ordering::Relaxed);
    }

    pub fn touch_last_ping(&self, now: crate::clock::Timestamp) {
        *self.last_ping_at.lock() = Some(now);
    }

    pub fn last_ping_at(&self) -> Option<crate::clock::Timestamp> {
        *self.last_ping_at.lock()
    }

    /// Full reset of the FSM-owned records, performed whenever the endpoint
    /// re-enters `SendReset` from anywhere other than first creation.
    pub fn reset_records(&self) {
        self.clear_remote_gid();
        self.clear_negotiated();
        self.reset_send_retries();
        self.reset_ack_retries();
        self.reset_probe_completions();
        *self.pending_ack.lock() = PendingAck::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_ack_rejects_mismatched_packet_num() {
        let ep = ProbeEndpoint::new(Direction::Send, Gid::ZERO, ProbeConfig::default());
        ep.record_pending(Command::Ping, 17);
        assert!(!ep.take_pending_if_matches(Command::Ping, 16));
        assert!(ep.is_ack_pending());
        assert!(ep.take_pending_if_matches(Command::Ping, 17));
        assert!(!ep.is_ack_pending());
    }

    #[test]
    fn packet_num_wraps() {
        let ep = ProbeEndpoint::new(Direction::Send, Gid::ZERO, ProbeConfig::default());
        ep.control_packet_num.store(0xFFFF, Ordering::Relaxed);
        assert_eq!(ep.next_packet_num(), 0xFFFF);
        assert_eq!(ep.next_packet_num(), 0x0000);
    }

    #[test]
    fn deferred_ack_drains_once() {
        let ep = ProbeEndpoint::new(Direction::Receive, Gid::ZERO, ProbeConfig::default());
        ep.set_deferred(Command::Reset, 42, 5);
        let drained = ep.take_deferred().unwrap();
        assert_eq!(drained.packet_num, 42);
        assert!(ep.take_deferred().is_none());
    }
}
