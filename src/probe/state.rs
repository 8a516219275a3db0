// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The probe states (spec.md §4.4). Unlike `crate::state`'s declarative
//! machinery, transitions here are data-dependent (they branch on the
//! peer's advertised probe version, on ack/packet-number matches, and on
//! Endpoint Manager completions) so they are hand-written in
//! `crate::probe::fsm` rather than generated; this module only holds the
//! state enum and the handful of state-only predicates the FSM needs.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeState {
    Idle,
    SendReset,
    SendProtocolVersion,
    Resetting,
    ResetDone,
    WaitForStart,
    EfaStart,
    EfaProbe,
    EfaTxProbeAcks,
    EfaConnected,
    EfaConnectedPing,
    EfaReset,
    Destroy,
}

impl ProbeState {
    /// The initial state for a direction (spec.md §3: "initial value is
    /// `Idle` for send, `SendReset` for receive").
    #[inline]
    pub fn initial(direction: super::endpoint::Direction) -> Self {
        match direction {
            super::endpoint::Direction::Send => Self::Idle,
            super::endpoint::Direction::Receive => Self::SendReset,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::EfaConnected | Self::EfaConnectedPing)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroy)
    }
}
