// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! Named timers, retry budgets, and pool bounds from the design doc (§6, §8).
//!
//! Every magic number the probe state machine touches lives here, not inline,
//! so a test harness can shrink the cadence without hand-editing the FSM (the
//! same reason the teacher crate threads an `ApplicationParams`/RTT estimator
//! through its worker state instead of hard-coding timeouts).

use std::time::Duration;

/// How often `SendReset` resends its reset command while waiting for an ack.
pub const SEND_RESET_FREQUENCY_MS: u64 = 100;

/// How long the FSM waits for an ack to any command it posted with
/// `requires_ack = true` before retrying.
pub const TX_COMMAND_ACK_TIMEOUT_MS: u64 = 100;

/// Ping cadence once negotiation settles on probe version >= 5.
pub const SEND_PING_FREQUENCY_MS: u64 = 1_000;

/// Ping cadence when the negotiated peer is on the legacy codec (probe
/// version < 5).
pub const LEGACY_SEND_PING_COMMAND_FREQUENCY_MS: u64 = 3_000;

/// How long the Endpoint Manager waits for a fabric completion before
/// considering the operation failed.
pub const ENDPOINT_MANAGER_COMPLETION_TIMEOUT_MS: u64 = 5_000;

/// How long `EfaProbe` waits for the receiver's `Connected` before giving up
/// and resetting.
pub const EFA_PROBE_MONITOR_TIMEOUT_MS: u64 = 3_000;

/// How long `EfaTxProbeAcks` waits for each probe-packet ack.
pub const EFA_TX_PROBE_ACK_TIMEOUT_MS: u64 = 1_000;

/// Maximum number of retries for any command requiring an ack before the FSM
/// gives up and transitions to `EfaReset`.
pub const TX_COMMAND_MAX_RETRIES: u32 = 5;

/// Maximum number of retries while collecting probe-packet acks.
pub const EFA_TX_PROBE_ACK_MAX_RETRIES: u32 = 5;

/// Number of fabric probe frames the sender posts immediately after
/// `EfaStart`; the receiver must observe exactly this many before emitting
/// `Connected`.
pub const EFA_PROBE_PACKET_COUNT: usize = 10;

/// Byte value used to fill fabric probe frames.
pub const EFA_PROBE_PACKET_DATA_PATTERN: u8 = 0xCD;

/// In-flight send counter threshold past which the fabric facade must flush
/// (stop setting the "more-to-send" hint) even without an explicit request.
pub const EFA_TX_PACKET_CACHE_SIZE: usize = 4;

/// Lower bound on the control-channel work-request pool: one slot per
/// in-flight probe command, plus one so the FSM is never starved while a
/// retransmit is in flight.
pub const MAX_PROBE_CONTROL_COMMANDS_PER_CONNECTION: usize = 8;

/// Maximum encoded size of a probe control header (checksum + version +
/// command + packet_num + ip string + port + gid + stream name + tail).
pub const MAX_PROBE_HEADER_SIZE: usize = 256;

/// Probe version at/above which the `ProtocolVersion` command is used during
/// negotiation.
pub const MIN_PROBE_VERSION_FOR_NEGOTIATION: u8 = 3;

/// Probe version at/above which the shortened ping cadence applies.
pub const MIN_PROBE_VERSION_FOR_FAST_PING: u8 = 5;

/// Tunable copies of the constants above, threaded through the Endpoint
/// Manager and every `ProbeEndpoint` so tests can run the whole state
/// machine at a sub-millisecond cadence instead of waiting on real wall
/// clock timers.
#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    pub send_reset_frequency: Duration,
    pub tx_command_ack_timeout: Duration,
    pub send_ping_frequency: Duration,
    pub legacy_send_ping_frequency: Duration,
    pub endpoint_manager_completion_timeout: Duration,
    pub efa_probe_monitor_timeout: Duration,
    pub efa_tx_probe_ack_timeout: Duration,
    pub tx_command_max_retries: u32,
    pub efa_tx_probe_ack_max_retries: u32,
    pub efa_probe_packet_count: usize,
    pub control_pool_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            send_reset_frequency: Duration::from_millis(SEND_RESET_FREQUENCY_MS),
            tx_command_ack_timeout: Duration::from_millis(TX_COMMAND_ACK_TIMEOUT_MS),
            send_ping_frequency: Duration::from_millis(SEND_PING_FREQUENCY_MS),
            legacy_send_ping_frequency: Duration::from_millis(
                LEGACY_SEND_PING_COMMAND_FREQUENCY_MS,
            ),
            endpoint_manager_completion_timeout: Duration::from_millis(
                ENDPOINT_MANAGER_COMPLETION_TIMEOUT_MS,
            ),
            efa_probe_monitor_timeout: Duration::from_millis(EFA_PROBE_MONITOR_TIMEOUT_MS),
            efa_tx_probe_ack_timeout: Duration::from_millis(EFA_TX_PROBE_ACK_TIMEOUT_MS),
            tx_command_max_retries: TX_COMMAND_MAX_RETRIES,
            efa_tx_probe_ack_max_retries: EFA_TX_PROBE_ACK_MAX_RETRIES,
            efa_probe_packet_count: EFA_PROBE_PACKET_COUNT,
            control_pool_capacity: MAX_PROBE_CONTROL_COMMANDS_PER_CONNECTION + 1,
        }
    }
}

impl ProbeConfig {
    /// Scales every timer down for fast, deterministic unit tests while
    /// preserving the retry-count and packet-count invariants under test.
    #[cfg(any(test, feature = "testing"))]
    pub fn for_testing() -> Self {
        Self {
            send_reset_frequency: Duration::from_millis(2),
            tx_command_ack_timeout: Duration::from_millis(2),
            send_ping_frequency: Duration::from_millis(5),
            legacy_send_ping_frequency: Duration::from_millis(10),
            endpoint_manager_completion_timeout: Duration::from_millis(50),
            efa_probe_monitor_timeout: Duration::from_millis(20),
            efa_tx_probe_ack_timeout: Duration::from_millis(5),
            efa_probe_packet_count: 4,
            ..Self::default()
        }
    }
}
