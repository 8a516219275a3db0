// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The control channel (C3): a bidirectional, unreliable datagram endpoint
//! carrying only probe frames. Per Design Notes §9, the actual datagram
//! transport (the "UDP-like control transport") is an external collaborator
//! whose contract is fixed by spec.md §6 — this module does not speak raw
//! sockets itself, it wraps a `Transport` trait the way the fabric facade
//! (`crate::fabric`) wraps the fabric provider, so a real UDP socket, a
//! loopback pair, or a fault-injecting wrapper can all stand in for it under
//! test.
//!
//! `ControlChannel` never retransmits — every retry in this crate lives in
//! the probe FSM (spec.md §4.3) — it only enqueues outgoing frames and
//! dispatches incoming ones to a single registered consumer.

use crate::error::{Error, Kind, Transient};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::{io, net::SocketAddr};

/// The datagram transport a control channel is built on. Implementations:
/// `UdpTransport` (real sockets) here, and loopback/fault-injecting doubles
/// under `crate::testing`.
pub trait Transport: Send + Sync {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_port(&self) -> u16;
}

/// A real, non-blocking UDP socket.
pub struct UdpTransport {
    socket: std::net::UdpSocket,
    port: u16,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        Ok(Self { socket, port })
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.socket.send_to(buf, dest).map(drop)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// The single consumer of decoded-or-not incoming datagrams. Registered
/// once by the connection-level dispatcher (spec.md §4.3, §5: "the
/// control-receive thread ... posts `RxPacket` commands into each
/// endpoint's FSM queue").
type Consumer = Box<dyn Fn(Vec<u8>, SocketAddr) + Send>;

pub struct ControlChannel<T: Transport> {
    transport: T,
    outgoing: ArrayQueue<(SocketAddr, Vec<u8>)>,
    consumer: Mutex<Option<Consumer>>,
}

impl<T: Transport> ControlChannel<T> {
    pub fn new(transport: T, queue_capacity: usize) -> Self {
        Self {
            transport,
            outgoing: ArrayQueue::new(queue_capacity),
            consumer: Mutex::new(None),
        }
    }

    pub fn get_port(&self) -> u16 {
        self.transport.local_port()
    }

    /// Registers the sole consumer of inbound datagrams. A later call
    /// replaces the previous consumer rather than stacking them.
    pub fn register_consumer(&self, consumer: Consumer) {
        *self.consumer.lock() = Some(consumer);
    }

    /// Enqueues `packet` for delivery to `dest`. Returns immediately;
    /// nothing here retries a send that the transport drops.
    pub fn send(&self, dest: SocketAddr, packet: Vec<u8>) -> Result<(), Error> {
        self.outgoing
            .push((dest, packet))
            .map_err(|_| Error::new(Kind::Transient(Transient::ControlBackpressure)))
    }

    /// Drains every queued outbound frame through the transport. Called
    /// from the control-send path of the connection's I/O loop.
    pub fn drain_sends(&self) -> io::Result<usize> {
        let mut sent = 0;
        while let Some((dest, packet)) = self.outgoing.pop() {
            self.transport.send_to(&packet, dest)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Performs one receive and, if a consumer is registered, hands it the
    /// datagram. Returns `Ok(false)` (not an error) when the transport has
    /// nothing pending, so callers can poll in a loop without treating
    /// "no data yet" as a failure.
    pub fn poll_recv(&self, buf: &mut [u8]) -> io::Result<bool> {
        match self.transport.recv_from(buf) {
            Ok((len, source)) => {
                if let Some(consumer) = self.consumer.lock().as_ref() {
                    consumer(buf[..len].to_vec(), source);
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct LoopbackTransport {
        port: u16,
        inbox: ArrayQueue<(Vec<u8>, SocketAddr)>,
    }

    impl Transport for LoopbackTransport {
        fn send_to(&self, _buf: &[u8], _dest: SocketAddr) -> io::Result<()> {
            Ok(())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.inbox.pop() {
                Some((payload, addr)) => {
                    buf[..payload.len()].copy_from_slice(&payload);
                    Ok((payload.len(), addr))
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn local_port(&self) -> u16 {
            self.port
        }
    }

    fn loopback_addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn send_backpressure_is_reported_not_blocking() {
        let channel = ControlChannel::new(
            LoopbackTransport {
                port: 4000,
                inbox: ArrayQueue::new(1),
            },
            1,
        );
        channel.send(loopback_addr(), vec![1]).unwrap();
        assert!(channel.send(loopback_addr(), vec![2]).is_err());
    }

    #[test]
    fn recv_dispatches_to_registered_consumer() {
        let channel = ControlChannel::new(
            LoopbackTransport {
                port: 4001,
                inbox: ArrayQueue::new(4),
            },
            4,
        );
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        channel.register_consumer(Box::new(move |_payload, _addr| {
            received_clone.fetch_add(1, Ordering::SeqCst);
        }));
        channel
            .transport
            .inbox
            .push((vec![9, 9], loopback_addr()))
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(channel.poll_recv(&mut buf).unwrap());
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn poll_recv_reports_no_data_without_error() {
        let channel = ControlChannel::new(
            LoopbackTransport {
                port: 4002,
                inbox: ArrayQueue::new(1),
            },
            1,
        );
        let mut buf = [0u8; 16];
        assert!(!channel.poll_recv(&mut buf).unwrap());
    }
}
