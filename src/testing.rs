// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the two external-collaborator seams this crate defines
//! traits for (Design Notes §9): a `Fabric` loopback pair standing in for
//! real hardware, a `Transport` loopback pair standing in for a real UDP
//! socket, and fault-injecting wrappers over both so the retry and reset
//! paths in spec.md §4.4/§7 can be driven deterministically instead of
//! waiting on real packet loss. Gated behind `feature = "testing"` (always
//! on for `cfg(test)`), mirroring the teacher's own
//! `#[cfg(any(test, feature = "testing"))] pub mod testing`.

use crate::{
    control_channel::Transport,
    error::{Error, Kind, Transient},
    fabric::{Completion, CompletionStatus, Fabric},
    gid::Gid,
};
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Bound on how many faults a `FaultSchedule` can have queued at once
/// (Design Notes §9: "prefer strictly bounded pools in the rewrite").
const MAX_SCHEDULED_FAULTS: usize = 64;

/// One fault to apply to a future call, keyed by the index of the call it
/// applies to (the `n`-th `post_send`/`send_to`, zero-based).
#[derive(Clone, Copy, Debug)]
struct ScheduledFault {
    call_index: u64,
    kind: FaultKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Drop,
    Duplicate,
}

/// A deterministic, explicitly-scheduled set of faults: "the 3rd send is
/// dropped", "the 7th is duplicated". Deterministic rather than randomized
/// since this crate carries no RNG dependency and property tests need
/// reproducible failures to assert a specific retry count against.
#[derive(Default)]
pub struct FaultSchedule {
    calls: AtomicU64,
    faults: Mutex<ArrayVec<ScheduledFault, MAX_SCHEDULED_FAULTS>>,
}

impl FaultSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `kind` to apply to the `call_index`-th call. Panics if more
    /// than `MAX_SCHEDULED_FAULTS` are queued at once — a test that needs
    /// more than that is exercising something other than a bounded retry
    /// budget.
    pub fn at(&self, call_index: u64, kind: FaultKind) -> &Self {
        self.faults
            .lock()
            .try_push(ScheduledFault { call_index, kind })
            .expect("fault schedule capacity exceeded");
        self
    }

    /// Consults and clears any fault scheduled for the next call, advancing
    /// the call counter regardless of whether one was found.
    fn next(&self) -> Option<FaultKind> {
        let index = self.calls.fetch_add(1, Ordering::Relaxed);
        let mut faults = self.faults.lock();
        let position = faults.iter().position(|f| f.call_index == index)?;
        Some(faults.remove(position).kind)
    }
}

/// Wraps a `Transport` so `FaultSchedule` can drop or duplicate outgoing
/// datagrams before they reach the loopback pair (spec.md §4.3: "does not
/// retransmit; all retry logic lives in the FSM" — these faults are what
/// exercises that retry logic in tests).
pub struct FaultTransport<T: Transport> {
    inner: T,
    schedule: Arc<FaultSchedule>,
}

impl<T: Transport> FaultTransport<T> {
    pub fn new(inner: T, schedule: Arc<FaultSchedule>) -> Self {
        Self { inner, schedule }
    }
}

impl<T: Transport> Transport for FaultTransport<T> {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()> {
        match self.schedule.next() {
            Some(FaultKind::Drop) => Ok(()),
            Some(FaultKind::Duplicate) => {
                self.inner.send_to(buf, dest)?;
                self.inner.send_to(buf, dest)
            }
            None => self.inner.send_to(buf, dest),
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn local_port(&self) -> u16 {
        self.inner.local_port()
    }
}

/// One end of an in-memory, non-blocking datagram pair standing in for two
/// real UDP sockets talking to each other (spec.md §4.3's "UDP-like control
/// transport" external collaborator).
pub struct LoopbackTransport {
    port: u16,
    self_addr: SocketAddr,
    inbox: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>,
    peer_inbox: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>,
}

/// Builds two `LoopbackTransport`s wired to each other: anything `a` sends
/// arrives in `b`'s `recv_from`, tagged with `a`'s address, and vice versa.
pub fn loopback_transport_pair(
    addr_a: SocketAddr,
    addr_b: SocketAddr,
) -> (LoopbackTransport, LoopbackTransport) {
    let inbox_a = Arc::new(Mutex::new(VecDeque::new()));
    let inbox_b = Arc::new(Mutex::new(VecDeque::new()));
    (
        LoopbackTransport {
            port: addr_a.port(),
            self_addr: addr_a,
            inbox: inbox_a.clone(),
            peer_inbox: inbox_b.clone(),
        },
        LoopbackTransport {
            port: addr_b.port(),
            self_addr: addr_b,
            inbox: inbox_b,
            peer_inbox: inbox_a,
        },
    )
}

impl Transport for LoopbackTransport {
    fn send_to(&self, buf: &[u8], _dest: SocketAddr) -> io::Result<()> {
        self.peer_inbox.lock().push_back((buf.to_vec(), self.self_addr));
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.inbox.lock().pop_front() {
            Some((payload, from)) => {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Shared state for one direction of fabric traffic between a send-role and
/// a receive-role `LoopbackFabric`: spec.md §4.6's "sender posts
/// `EFA_PROBE_PACKET_COUNT` frames, receiver collects them" modeled without
/// any real hardware, so the probe FSM's `EfaStart`/`EfaProbe`/
/// `EfaTxProbeAcks` dance can be driven in-process.
#[derive(Default)]
struct Wire {
    /// Receive contexts posted (`post_receive`) with no frame to match yet.
    pending_receives: VecDeque<u64>,
    /// Frames sent (`post_send`) with no waiting receive context yet.
    unmatched_sends: usize,
    /// Completions for the receive side, drained by the receive-role fabric.
    receiver_completions: VecDeque<Completion>,
}

pub struct LoopbackFabric {
    direction: crate::probe::Direction,
    wire: Arc<Mutex<Wire>>,
    send_completions: Mutex<VecDeque<Completion>>,
    opened: std::sync::atomic::AtomicBool,
    fault: Option<Arc<FaultSchedule>>,
    provider_message_count: AtomicU64,
}

/// Builds a send-role/receive-role `LoopbackFabric` pair sharing one `Wire`.
pub fn loopback_fabric_pair() -> (LoopbackFabric, LoopbackFabric) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    (
        LoopbackFabric {
            direction: crate::probe::Direction::Send,
            wire: wire.clone(),
            send_completions: Mutex::new(VecDeque::new()),
            opened: std::sync::atomic::AtomicBool::new(false),
            fault: None,
            provider_message_count: AtomicU64::new(0),
        },
        LoopbackFabric {
            direction: crate::probe::Direction::Receive,
            wire,
            send_completions: Mutex::new(VecDeque::new()),
            opened: std::sync::atomic::AtomicBool::new(false),
            fault: None,
            provider_message_count: AtomicU64::new(0),
        },
    )
}

impl LoopbackFabric {
    /// Attaches a fault schedule applying to this fabric's `post_send` calls
    /// only (the send side is where spec.md §7's `FabricLost::SendFailed`
    /// originates).
    pub fn with_fault_schedule(mut self, schedule: Arc<FaultSchedule>) -> Self {
        self.fault = Some(schedule);
        self
    }

    /// Count of completions this fabric has classified as
    /// `Error::ProviderOnlyMessage` (spec.md §9 Open Question) rather than
    /// dropped silently.
    pub fn provider_message_count(&self) -> u64 {
        self.provider_message_count.load(Ordering::Relaxed)
    }
}

impl Fabric for LoopbackFabric {
    fn open(&mut self, _local_gid: Gid, _remote_gid: Option<Gid>) -> Result<(), Error> {
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn post_send(&mut self, _payload: &[u8], context: u64, _more_to_send: bool) -> Result<(), Error> {
        if let Some(fault) = &self.fault {
            if fault.next() == Some(FaultKind::Drop) {
                return Err(Error::new(Kind::Transient(Transient::FabricRetry)));
            }
        }

        self.send_completions.lock().push_back(Completion {
            context,
            status: CompletionStatus::Ok,
        });

        let mut wire = self.wire.lock();
        if let Some(receive_context) = wire.pending_receives.pop_front() {
            wire.receiver_completions.push_back(Completion {
                context: receive_context,
                status: CompletionStatus::Ok,
            });
        } else {
            wire.unmatched_sends += 1;
        }
        Ok(())
    }

    fn post_receive(&mut self, context: u64, _more_to_post: bool) -> Result<(), Error> {
        let mut wire = self.wire.lock();
        if wire.unmatched_sends > 0 {
            wire.unmatched_sends -= 1;
            wire.receiver_completions.push_back(Completion {
                context,
                status: CompletionStatus::Ok,
            });
        } else {
            wire.pending_receives.push_back(context);
        }
        Ok(())
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>, max: usize) -> (usize, usize) {
        let mut source = match self.direction {
            crate::probe::Direction::Send => self.send_completions.lock(),
            crate::probe::Direction::Receive => {
                // receiver_completions lives on the shared wire; re-borrow it
                // through a scratch lock rather than holding `wire` and
                // `send_completions` locked at once.
                let mut wire = self.wire.lock();
                let mut ok = 0;
                let mut err = 0;
                while out.len() < max {
                    match wire.receiver_completions.pop_front() {
                        Some(completion) => {
                            match completion.status {
                                CompletionStatus::Ok => ok += 1,
                                CompletionStatus::Failed => err += 1,
                            }
                            out.push(completion);
                        }
                        None => break,
                    }
                }
                return (ok, err);
            }
        };

        let mut ok = 0;
        let mut err = 0;
        while out.len() < max {
            match source.pop_front() {
                Some(completion) => {
                    match completion.status {
                        CompletionStatus::Ok => ok += 1,
                        CompletionStatus::Failed => err += 1,
                    }
                    out.push(completion);
                }
                None => break,
            }
        }
        (ok, err)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.opened.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_transport_pair_delivers_in_order() {
        let (a, b) = loopback_transport_pair(
            "192.0.2.1:4791".parse().unwrap(),
            "192.0.2.2:4791".parse().unwrap(),
        );
        a.send_to(b"one", "192.0.2.2:4791".parse().unwrap()).unwrap();
        a.send_to(b"two", "192.0.2.2:4791".parse().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"one");
        assert_eq!(from.port(), 4791);

        let (len, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"two");
    }

    #[test]
    fn fault_schedule_drops_only_the_scheduled_call() {
        let (a, b) = loopback_transport_pair(
            "192.0.2.1:4791".parse().unwrap(),
            "192.0.2.2:4791".parse().unwrap(),
        );
        let schedule = Arc::new(FaultSchedule::new());
        schedule.at(1, FaultKind::Drop);
        let a = FaultTransport::new(a, schedule);

        a.send_to(b"first", "192.0.2.2:4791".parse().unwrap()).unwrap();
        a.send_to(b"dropped", "192.0.2.2:4791".parse().unwrap()).unwrap();
        a.send_to(b"third", "192.0.2.2:4791".parse().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"first");
        let (len, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"third");
        assert!(b.recv_from(&mut buf).is_err());
    }

    #[test]
    fn loopback_fabric_matches_sends_to_already_posted_receives() {
        let (mut sender, mut receiver) = loopback_fabric_pair();
        receiver.post_receive(100, false).unwrap();
        receiver.post_receive(101, false).unwrap();
        sender.post_send(&[0xCD; 8], 1, true).unwrap();
        sender.post_send(&[0xCD; 8], 2, false).unwrap();

        let mut send_completions = Vec::new();
        let (ok, err) = sender.drain_completions(&mut send_completions, 8);
        assert_eq!((ok, err), (2, 0));

        let mut recv_completions = Vec::new();
        let (ok, err) = receiver.drain_completions(&mut recv_completions, 8);
        assert_eq!((ok, err), (2, 0));
        assert_eq!(recv_completions[0].context, 100);
        assert_eq!(recv_completions[1].context, 101);
    }

    #[test]
    fn loopback_fabric_matches_sends_arriving_before_receives_are_posted() {
        let (mut sender, mut receiver) = loopback_fabric_pair();
        sender.post_send(&[0xCD; 8], 1, false).unwrap();
        receiver.post_receive(200, false).unwrap();

        let mut recv_completions = Vec::new();
        let (ok, _) = receiver.drain_completions(&mut recv_completions, 8);
        assert_eq!(ok, 1);
        assert_eq!(recv_completions[0].context, 200);
    }

    #[test]
    fn fault_schedule_on_fabric_forces_a_transient_send_error() {
        let (sender, _receiver) = loopback_fabric_pair();
        let schedule = Arc::new(FaultSchedule::new());
        schedule.at(0, FaultKind::Drop);
        let mut sender = sender.with_fault_schedule(schedule);
        assert!(sender.post_send(&[0xCD; 8], 1, false).is_err());
    }
}
