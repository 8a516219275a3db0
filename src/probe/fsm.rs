// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The probe transition logic (spec.md §4.4). Written as pure functions —
//! `on_tick`, `on_rx`, `on_manager_outcome`, `on_fabric_probe_completion` —
//! that read/mutate only the `ProbeEndpoint` records and return the side
//! effects the driver (`crate::probe::driver`) must carry out, per Design
//! Notes §9 ("express it as a pure function `process(state, event, now) ->
//! (next_state, next_deadline, side_effects)`; the driver then executes
//! side effects"). This is what makes the transition table in spec.md §4.4
//! unit-testable without a real control channel or fabric.

use super::{
    command::ManagerOutcome,
    endpoint::{CodecKind, Direction, ProbeEndpoint},
    state::ProbeState,
};
use crate::{
    clock::Timestamp,
    codec::{Command, DecodedHeader},
};
use std::time::Duration;

/// A side effect the FSM core decided on but did not carry out itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    NotifyConnected,
    NotifyDisconnected { message: Option<String> },
    /// Send a control-channel frame. `ack_target` is set for `Ack` frames.
    /// `codec` is decided here, where the FSM knows which rule in spec.md
    /// §4.1 applies, rather than re-derived by the driver.
    SendControl {
        command: Command,
        requires_ack: bool,
        packet_num: u16,
        ack_target: Option<(Command, u16)>,
        codec: CodecKind,
    },
    QueueEndpointStart,
    QueueEndpointReset,
    OpenFabricFlows,
    PostProbeFrames { count: usize },
    EnableApplicationPath,
    /// A probe-frame completion arrived outside the state expecting one
    /// (spec.md §3, §8: treated as an error, not silently dropped).
    SurplusProbeCompletion,
}

fn notify_disconnected(message: Option<&str>) -> Effect {
    Effect::NotifyDisconnected {
        message: message.map(str::to_owned),
    }
}

/// `Idle`/`SendReset` row: (re)send `Reset` and re-arm.
fn enter_send_reset(ep: &ProbeEndpoint, effects: &mut Vec<Effect>) -> Duration {
    ep.reset_records();
    effects.push(notify_disconnected(None));
    let packet_num = ep.next_packet_num();
    ep.record_pending(Command::Reset, packet_num);
    effects.push(Effect::SendControl {
        command: Command::Reset,
        requires_ack: true,
        packet_num,
        ack_target: None,
        codec: CodecKind::Legacy,
    });
    ep.set_state(ProbeState::SendReset);
    Duration::from_millis(ep.config.send_reset_frequency.as_millis() as u64)
}

/// Handles one timer firing, i.e. `wait_timeout_ms` elapsed with no command
/// arriving (spec.md §4.4 driver step 4).
pub fn on_tick(ep: &ProbeEndpoint, now: Timestamp) -> (Duration, Vec<Effect>) {
    let mut effects = Vec::new();
    let deadline = match ep.state() {
        ProbeState::Idle | ProbeState::SendReset => enter_send_reset(ep, &mut effects),

        ProbeState::SendProtocolVersion => {
            if ep.send_retries() >= ep.config.tx_command_max_retries {
                ep.set_state(ProbeState::EfaReset);
                Duration::ZERO
            } else {
                ep.bump_send_retries();
                let packet_num = ep.next_packet_num();
                ep.record_pending(Command::ProtocolVersion, packet_num);
                effects.push(Effect::SendControl {
                    command: Command::ProtocolVersion,
                    requires_ack: true,
                    packet_num,
                    ack_target: None,
                    codec: CodecKind::Sdk,
                });
                ep.config.tx_command_ack_timeout
            }
        }

        ProbeState::WaitForStart => {
            // no start completion arrived in time; go back and renegotiate
            enter_send_reset(ep, &mut effects)
        }

        ProbeState::EfaStart => {
            effects.push(Effect::OpenFabricFlows);
            effects.push(Effect::PostProbeFrames {
                count: ep.config.efa_probe_packet_count,
            });
            ep.set_state(ProbeState::EfaProbe);
            ep.config.efa_probe_monitor_timeout
        }

        ProbeState::EfaProbe => {
            ep.set_state(ProbeState::EfaReset);
            Duration::ZERO
        }

        ProbeState::EfaTxProbeAcks => {
            if ep.bump_ack_retries() > ep.config.efa_tx_probe_ack_max_retries {
                ep.set_state(ProbeState::EfaReset);
                Duration::ZERO
            } else {
                ep.config.efa_tx_probe_ack_timeout
            }
        }

        ProbeState::EfaConnected => match ep.direction {
            Direction::Send => {
                let packet_num = ep.next_packet_num();
                ep.record_pending(Command::Ping, packet_num);
                effects.push(Effect::SendControl {
                    command: Command::Ping,
                    requires_ack: true,
                    packet_num,
                    ack_target: None,
                    codec: negotiated_codec(ep),
                });
                ep.set_state(ProbeState::EfaConnectedPing);
                ep.config.tx_command_ack_timeout
            }
            Direction::Receive => {
                let window = ping_liveness_window(ep);
                let elapsed = ep
                    .last_ping_at()
                    .map(|last| now.saturating_duration_since(last))
                    .unwrap_or(Duration::MAX);
                if elapsed > window {
                    ep.set_state(ProbeState::EfaReset);
                    Duration::ZERO
                } else {
                    window - elapsed
                }
            }
        },

        ProbeState::EfaConnectedPing => {
            if ep.ack_retries() >= ep.config.tx_command_max_retries {
                effects.push(notify_disconnected(Some("ping acknowledgment timed out")));
                ep.set_state(ProbeState::EfaReset);
                Duration::ZERO
            } else {
                ep.bump_ack_retries();
                let packet_num = ep.next_packet_num();
                ep.record_pending(Command::Ping, packet_num);
                effects.push(Effect::SendControl {
                    command: Command::Ping,
                    requires_ack: true,
                    packet_num,
                    ack_target: None,
                    codec: negotiated_codec(ep),
                });
                ep.config.tx_command_ack_timeout
            }
        }

        ProbeState::EfaReset => {
            effects.push(Effect::QueueEndpointReset);
            ep.set_state(ProbeState::Resetting);
            ep.config.endpoint_manager_completion_timeout
        }

        ProbeState::Resetting => ep.config.endpoint_manager_completion_timeout,

        ProbeState::ResetDone => {
            // A peer-initiated `Reset` leaves a deferred ack behind (see
            // `on_rx`'s `Command::Reset` arm) and only ever tore down to
            // resume the existing handshake, so it acks and proceeds
            // straight to `WaitForStart`. An `EfaReset`-initiated reset
            // (ping timeout, fabric loss) leaves nothing deferred and must
            // renegotiate from scratch (spec.md §8 scenario 4), the same as
            // any other fresh `SendReset` entry.
            if let Some(deferred) = ep.take_deferred() {
                let codec = if deferred.remote_probe_version
                    >= crate::config::MIN_PROBE_VERSION_FOR_NEGOTIATION
                {
                    CodecKind::Sdk
                } else {
                    CodecKind::Legacy
                };
                effects.push(Effect::SendControl {
                    command: Command::Ack,
                    requires_ack: false,
                    packet_num: ep.next_packet_num(),
                    ack_target: deferred.command.map(|c| (c, deferred.packet_num)),
                    codec,
                });
                ep.set_state(ProbeState::WaitForStart);
                effects.push(Effect::QueueEndpointStart);
                Duration::ZERO
            } else {
                enter_send_reset(ep, &mut effects)
            }
        }

        ProbeState::Destroy => Duration::from_secs(3600),
    };
    (deadline, effects)
}

fn negotiated_codec(ep: &ProbeEndpoint) -> CodecKind {
    ep.negotiated().map(|n| n.codec).unwrap_or(CodecKind::Legacy)
}

fn ping_liveness_window(ep: &ProbeEndpoint) -> Duration {
    match ep.negotiated() {
        Some(n) if n.peer_version.supports_fast_ping() => ep.config.send_ping_frequency * 3,
        _ => ep.config.legacy_send_ping_frequency * 2,
    }
}

/// The cadence the send side re-arms after an accepted `Ping` ack (spec.md
/// §4.4 transition table: "re-arm `SEND_PING_FREQUENCY_MS` (or legacy value
/// when probe version < 5)"). Distinct from `ping_liveness_window`, which is
/// the receive side's multiple of this same frequency.
fn ping_send_frequency(ep: &ProbeEndpoint) -> Duration {
    match ep.negotiated() {
        Some(n) if n.peer_version.supports_fast_ping() => ep.config.send_ping_frequency,
        _ => ep.config.legacy_send_ping_frequency,
    }
}

/// Handles one decoded control-channel frame (spec.md §4.4 driver step 3).
/// Returns the effects to carry out and the deadline the driver should wait
/// on next — mirroring `on_tick`'s `(deadline, effects)` shape, since step 3
/// of the driver loop "may change state and rewrite `wait_timeout_ms`" just
/// like a tick does.
pub fn on_rx(ep: &ProbeEndpoint, header: DecodedHeader, now: Timestamp) -> (Vec<Effect>, Duration) {
    let mut effects = Vec::new();
    let mut deadline = Duration::ZERO;

    match header.command {
        Command::Ack => {
            if let Some((command, packet_num)) = header.ack_target() {
                if ep.take_pending_if_matches(command, packet_num) {
                    deadline = on_ack_accepted(ep, command, header, &mut effects);
                }
                // mismatched ack: logged and dropped (spec.md §4.4 tie-breaks)
                else if command != Command::Ping {
                    tracing::debug!(?command, packet_num, "dropping unmatched ack");
                }
            }
        }

        Command::Reset => {
            // spec.md §3: the remote GID (and the codec negotiated against
            // it) is cleared on every reset request, not just the
            // self-initiated `SendReset` path.
            ep.clear_remote_gid();
            ep.clear_negotiated();
            ep.set_deferred(
                Command::Reset,
                header.control_packet_num,
                header.sender_version.probe_version,
            );
            if ep.state() != ProbeState::Resetting {
                effects.push(Effect::QueueEndpointReset);
                ep.set_state(ProbeState::Resetting);
            }
        }

        Command::Ping => {
            // spec.md §4.4: "Ping commands are never logged individually"
            if ep.direction == Direction::Receive && ep.state().is_connected() {
                ep.touch_last_ping(now);
                if ep.state() == ProbeState::EfaConnectedPing {
                    ep.set_state(ProbeState::EfaConnected);
                }
                if header.requires_ack() {
                    effects.push(Effect::SendControl {
                        command: Command::Ack,
                        requires_ack: false,
                        packet_num: ep.next_packet_num(),
                        ack_target: Some((Command::Ping, header.control_packet_num)),
                        codec: negotiated_codec(ep),
                    });
                }
            }
        }

        Command::Connected => match ep.state() {
            ProbeState::EfaProbe => ep.set_state(ProbeState::EfaTxProbeAcks),
            _ => {
                tracing::debug!(state = ?ep.state(), "unexpected Connected command, resetting");
                ep.set_state(ProbeState::SendReset);
            }
        },

        Command::ProtocolVersion => {
            ep.set_negotiated(CodecKind::Sdk, header.sender_version);
            effects.push(Effect::SendControl {
                command: Command::Ack,
                requires_ack: false,
                packet_num: ep.next_packet_num(),
                ack_target: Some((Command::ProtocolVersion, header.control_packet_num)),
                codec: CodecKind::Sdk,
            });
        }
    }

    (effects, deadline)
}

/// Handles an accepted ack (the pending command it acks has been taken).
/// Returns the deadline the driver should re-arm, mirroring `on_tick`; most
/// transitions want the driver to act again immediately (`Duration::ZERO`,
/// e.g. to send the next negotiation step on the following tick), but the
/// `EfaConnectedPing -> EfaConnected` transition must re-arm the ping
/// cadence instead of letting the send side fire again right away.
fn on_ack_accepted(
    ep: &ProbeEndpoint,
    command: Command,
    header: DecodedHeader,
    effects: &mut Vec<Effect>,
) -> Duration {
    match (ep.state(), command) {
        (ProbeState::SendReset, Command::Reset) => {
            ep.set_remote_gid(header.sender_gid);
            ep.clear_negotiated();
            ep.reset_send_retries();
            if header.sender_version.supports_negotiation() {
                ep.set_state(ProbeState::SendProtocolVersion);
            } else {
                ep.set_negotiated(CodecKind::Legacy, header.sender_version);
                ep.set_state(ProbeState::WaitForStart);
                effects.push(Effect::QueueEndpointStart);
            }
            Duration::ZERO
        }
        (ProbeState::SendProtocolVersion, Command::ProtocolVersion) => {
            ep.set_negotiated(CodecKind::Sdk, header.sender_version);
            ep.reset_send_retries();
            ep.set_state(ProbeState::WaitForStart);
            effects.push(Effect::QueueEndpointStart);
            Duration::ZERO
        }
        (ProbeState::EfaConnectedPing, Command::Ping) => {
            ep.reset_ack_retries();
            ep.set_state(ProbeState::EfaConnected);
            ping_send_frequency(ep)
        }
        _ => {
            tracing::debug!(?command, state = ?ep.state(), "ack accepted in unexpected state");
            Duration::ZERO
        }
    }
}

/// A signal from the Endpoint Manager that a queued reset or start has
/// completed (spec.md §4.5).
pub fn on_manager_outcome(ep: &ProbeEndpoint, outcome: ManagerOutcome) -> Vec<Effect> {
    let mut effects = Vec::new();
    match outcome {
        ManagerOutcome::StartDone if ep.state() == ProbeState::WaitForStart => {
            ep.set_state(ProbeState::EfaStart);
        }
        ManagerOutcome::ResetDone if ep.state() == ProbeState::Resetting => {
            ep.set_state(ProbeState::ResetDone);
        }
        other => {
            tracing::debug!(?other, state = ?ep.state(), "manager outcome ignored outside expected state");
        }
    }
    effects
}

/// A fabric-level completion tied to one of the `EFA_PROBE_PACKET_COUNT`
/// probe frames: on the send side, our posted frame was acked by hardware;
/// on the receive side, we received one of the peer's frames.
pub fn on_fabric_probe_completion(ep: &ProbeEndpoint, ok: bool, now: Timestamp) -> Vec<Effect> {
    let mut effects = Vec::new();
    if !ok {
        return effects;
    }

    let target = ep.config.efa_probe_packet_count;
    let expecting = match (ep.direction, ep.state()) {
        (Direction::Send, ProbeState::EfaTxProbeAcks) => true,
        (Direction::Receive, ProbeState::EfaProbe) => true,
        _ => false,
    };
    if !expecting {
        // spec.md §8: "receiving N+1 acks is an error" — once the states
        // above have been left, any further completion is surplus.
        effects.push(Effect::SurplusProbeCompletion);
        return effects;
    }

    let count = ep.bump_probe_completions();
    if count >= target {
        ep.reset_probe_completions();
        // Seed the liveness clock here, not just in the `Ping` rx handler:
        // otherwise the receiver's very next `EfaConnected` tick sees
        // `last_ping_at() == None`, treats elapsed as unbounded, and resets
        // before the peer's first ping can arrive (spec.md §8 scenario 1).
        ep.touch_last_ping(now);
        ep.set_state(ProbeState::EfaConnected);
        effects.push(Effect::EnableApplicationPath);
        effects.push(Effect::NotifyConnected);
        if ep.direction == Direction::Receive {
            effects.push(Effect::SendControl {
                command: Command::Connected,
                requires_ack: false,
                packet_num: ep.next_packet_num(),
                ack_target: None,
                codec: negotiated_codec(ep),
            });
        }
    }
    effects
}

pub fn on_shutdown(ep: &ProbeEndpoint) -> Vec<Effect> {
    ep.set_state(ProbeState::Destroy);
    vec![Effect::NotifyDisconnected {
        message: Some("shutdown".to_owned()),
    }]
}
