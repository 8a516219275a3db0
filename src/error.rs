// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

use core::{fmt, panic::Location};

/// The error taxonomy from the design doc: callers branch on `kind`, not on
/// a numeric code. `Error` itself carries the call site so `Display`
/// produces a `crate/file:line` prefix the way the teacher's
/// `stream::send::error::Error` does.
#[derive(Clone, Copy)]
pub struct Error {
    kind: Kind,
    location: &'static Location<'static>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Kind {
    /// Retry once on the next tick, then propagate if it repeats.
    #[error("transient failure: {0}")]
    Transient(Transient),

    /// Reset and retry negotiation from `SendReset`.
    #[error("negotiation failure: {0}")]
    Negotiation(Negotiation),

    /// The fabric endpoint must be reset.
    #[error("fabric connection lost: {0}")]
    FabricLost(FabricLost),

    /// Fatal for the current operation; the endpoint enters reset.
    #[error("resource exhausted: {0}")]
    Resource(Resource),

    /// Cooperative exit; never surfaced to the application as a failure.
    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Transient {
    #[error("control channel backpressure")]
    ControlBackpressure,
    #[error("fabric send would block")]
    FabricRetry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Negotiation {
    #[error("no codec compatible with peer protocol version")]
    IncompatibleVersion,
    #[error("timed out waiting for an acknowledgment")]
    AckTimeout,
    #[error("received a malformed probe header")]
    MalformedHeader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FabricLost {
    #[error("fabric send failed after exhausting retries")]
    SendFailed,
    #[error("fabric reported a completion error")]
    CompletionError,
    #[error("fabric rejected a receive buffer post")]
    PostFailed,
    #[error("no ping observed within the liveness window")]
    PingTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Resource {
    #[error("work-request pool exhausted")]
    PoolExhausted,
    #[error("memory region registration failed")]
    MemoryRegistration,
    /// A completion tagged for the provider's own bookkeeping rather than
    /// one of our posted sends/receives (spec.md §9 Open Question: "what
    /// happens to provider-only small messages"). Kept as an explicit,
    /// counted variant rather than silently dropped, so a `Fabric`
    /// implementation can expose a running count of how often this fires.
    #[error("completion belongs to a provider-only message, not a posted request")]
    ProviderOnlyMessage,
    /// A probe-frame completion arrived after the endpoint had already
    /// collected its `EFA_PROBE_PACKET_COUNT` acks, or while the endpoint
    /// was outside the states that expect one at all (spec.md §3: "spurious
    /// completions outside the connected states are treated as errors";
    /// §8: "receiving N+1 acks is an error").
    #[error("probe-frame completion arrived outside the state that expected it")]
    SurplusProbeCompletion,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("crate", &"rdt-probe")
            .field("file", &self.file())
            .field("line", &self.location.line())
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let file = self.file();
        let line = self.location.line();
        write!(f, "[rdt-probe::{file}:{line}]: {}", self.kind)
    }
}

impl std::error::Error for Error {}

impl Error {
    #[track_caller]
    #[inline]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// True if local recovery inside the FSM's next tick is preferred over
    /// propagating to the application (spec.md §7).
    #[inline]
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self.kind, Kind::Transient(_))
    }

    /// True if this error means the endpoint must transition to `EfaReset`.
    #[inline]
    pub fn forces_reset(&self) -> bool {
        matches!(self.kind, Kind::Negotiation(_) | Kind::FabricLost(_))
    }

    #[inline]
    fn file(&self) -> &'static str {
        self.location
            .file()
            .trim_start_matches(concat!(env!("CARGO_MANIFEST_DIR"), "/src/"))
    }
}

impl From<Kind> for Error {
    #[track_caller]
    #[inline]
    fn from(kind: Kind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_matches_taxonomy() {
        assert!(Error::new(Kind::Transient(Transient::FabricRetry)).is_locally_recoverable());
        assert!(!Error::new(Kind::FabricLost(FabricLost::SendFailed)).is_locally_recoverable());
        assert!(Error::new(Kind::FabricLost(FabricLost::SendFailed)).forces_reset());
        assert!(Error::new(Kind::Negotiation(Negotiation::AckTimeout)).forces_reset());
        assert!(!Error::new(Kind::Resource(Resource::PoolExhausted)).forces_reset());
    }
}
