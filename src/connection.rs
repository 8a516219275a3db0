// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! Assembles C3-C6 into the thread topology spec.md §5 describes: one probe
//! thread per registered endpoint (`probe::Driver::run`, spawned here), one
//! poll thread draining every endpoint's fabric completions, and one
//! control-receive thread fanning decoded datagrams out to every endpoint's
//! command queue. `EndpointManager`/`ControlChannel`/`Fabric` are the pieces;
//! `Connection` is the thing that owns their threads end to end, the way the
//! teacher's `stream::server` module owns the worker threads built on top of
//! its lower-level `stream::send`/`stream::recv` pieces.

use crate::{
    clock::Clock,
    control_channel::{ControlChannel, Transport},
    endpoint_manager::{EndpointId, EndpointManager},
    fabric::{CompletionStatus, Fabric},
    gid::Gid,
    notifier::Notifier,
    pool::Pool,
    probe::{
        command::DriverCommand, endpoint::Direction, Driver, LocalIdentity, ProbeEndpoint,
    },
    config::ProbeConfig,
};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

/// Spent between idle poll/control-receive iterations. Spec.md §5 calls for
/// the poll thread to block on a `poll_do_work` signal rather than spin; the
/// real signal is the fabric driver's completion-queue wait primitive, an
/// external collaborator (spec.md §1) this crate does not own, so a short
/// sleep stands in for it here.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct EndpointHandle {
    id: EndpointId,
    commands: crossbeam_channel::Sender<DriverCommand>,
    fabric: Arc<Mutex<dyn Fabric>>,
    driver_thread: Option<JoinHandle<()>>,
}

/// One connection's worth of shared state: the endpoint manager, the control
/// channel, and every endpoint registered on it, plus the poll and
/// control-receive threads that keep them all moving (spec.md §5).
pub struct Connection<T: Transport> {
    manager: Arc<EndpointManager>,
    control: Arc<ControlChannel<T>>,
    clock: Arc<dyn Clock>,
    endpoints: Mutex<Vec<EndpointHandle>>,
    shutdown: Arc<AtomicBool>,
    io_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Connection<T> {
    /// Builds a connection around `transport` and wires its control channel's
    /// sole consumer (spec.md §4.3) to fan decoded datagrams out to every
    /// endpoint registered on it. Held as a `Weak` inside the consumer
    /// closure so the control channel does not keep the connection alive
    /// past `shutdown`.
    pub fn new(
        transport: T,
        control_queue_capacity: usize,
        notifier: Arc<Notifier>,
        config: ProbeConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let control = Arc::new(ControlChannel::new(transport, control_queue_capacity));
        let manager = Arc::new(EndpointManager::new(notifier, config));

        let this = Arc::new(Self {
            manager,
            control: control.clone(),
            clock,
            endpoints: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            io_threads: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&this);
        control.register_consumer(Box::new(move |payload, source_address| {
            let Some(this) = weak.upgrade() else { return };
            for endpoint in this.endpoints.lock().iter() {
                let _ = endpoint.commands.send(DriverCommand::RxPacket {
                    payload: payload.clone(),
                    source_address,
                });
            }
        }));

        this
    }

    pub fn control_port(&self) -> u16 {
        self.control.get_port()
    }

    pub fn manager(&self) -> &Arc<EndpointManager> {
        &self.manager
    }

    /// Registers a new probe endpoint, spawns its driver thread, and returns
    /// the `EndpointId` the Endpoint Manager now tracks it under.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_endpoint(
        self: &Arc<Self>,
        direction: Direction,
        local_gid: Gid,
        config: ProbeConfig,
        fabric: Arc<Mutex<dyn Fabric>>,
        pool: Arc<Pool>,
        local: LocalIdentity,
        initial_peer_addr: SocketAddr,
    ) -> EndpointId {
        let endpoint = Arc::new(ProbeEndpoint::new(direction, local_gid, config));
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = self.manager.register_endpoint(tx.clone());

        let driver = Driver::new(
            endpoint,
            id,
            self.manager.clone(),
            self.control.clone(),
            fabric.clone(),
            self.notifier_handle(),
            pool,
            self.clock.clone(),
            rx,
            local,
            initial_peer_addr,
        );

        let driver_thread = std::thread::Builder::new()
            .name(format!("rdt-probe-{direction:?}-{id:?}"))
            .spawn(move || driver.run())
            .expect("failed to spawn probe driver thread");

        self.endpoints.lock().push(EndpointHandle {
            id,
            commands: tx,
            fabric,
            driver_thread: Some(driver_thread),
        });
        id
    }

    fn notifier_handle(&self) -> Arc<Notifier> {
        // `EndpointManager` owns the single `Notifier` for this connection
        // (spec.md §4.5/§4.7: single-writer delivery); every driver shares it.
        self.manager.notifier()
    }

    /// Spawns the poll thread (drains every endpoint's fabric completions)
    /// and the control-receive thread (drives `ControlChannel::poll_recv` in
    /// a loop); both register with the Endpoint Manager so a queued
    /// reset/start/shutdown can park them (spec.md §4.5, §5).
    pub fn start_io_threads(self: &Arc<Self>) {
        let poll_conn = self.clone();
        let poll_thread = std::thread::Builder::new()
            .name("rdt-probe-poll".into())
            .spawn(move || poll_conn.run_poll_loop())
            .expect("failed to spawn poll thread");

        let control_conn = self.clone();
        let control_thread = std::thread::Builder::new()
            .name("rdt-probe-control-rx".into())
            .spawn(move || control_conn.run_control_receive_loop())
            .expect("failed to spawn control-receive thread");

        self.io_threads.lock().extend([poll_thread, control_thread]);
    }

    fn run_poll_loop(&self) {
        let participant = self.manager.register_thread("poll");
        let mut completions = Vec::new();
        while !self.shutdown.load(Ordering::Acquire) {
            if self.manager.is_pending() {
                self.manager.thread_wait(&participant);
                continue;
            }

            let mut drained_any = false;
            for endpoint in self.endpoints.lock().iter() {
                completions.clear();
                let (ok, err) = endpoint.fabric.lock().drain_completions(&mut completions, 32);
                if ok + err > 0 {
                    drained_any = true;
                }
                for completion in completions.drain(..) {
                    let _ = endpoint.commands.send(DriverCommand::FabricProbeCompletion {
                        ok: completion.status == CompletionStatus::Ok,
                    });
                }
            }

            if !drained_any {
                std::thread::sleep(IDLE_POLL_INTERVAL);
            }
        }
    }

    fn run_control_receive_loop(&self) {
        let participant = self.manager.register_thread("control-receive");
        let mut buf = [0u8; crate::config::MAX_PROBE_HEADER_SIZE];
        while !self.shutdown.load(Ordering::Acquire) {
            if self.manager.is_pending() {
                self.manager.thread_wait(&participant);
                continue;
            }

            match self.control.poll_recv(&mut buf) {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(IDLE_POLL_INTERVAL),
                Err(error) => {
                    tracing::warn!(%error, "control channel receive failed");
                    std::thread::sleep(IDLE_POLL_INTERVAL);
                }
            }
            let _ = self.control.drain_sends();
        }
    }

    /// Tells the Endpoint Manager to shut every registered endpoint down,
    /// then stops the poll and control-receive threads and joins everything
    /// this connection spawned. Idempotent only in the sense that a second
    /// call finds no threads left to join.
    pub fn shutdown(&self) {
        self.manager.shutdown_connection();
        self.shutdown.store(true, Ordering::Release);

        for endpoint in self.endpoints.lock().iter_mut() {
            if let Some(handle) = endpoint.driver_thread.take() {
                let _ = handle.join();
            }
        }
        for handle in self.io_threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        notifier::{Notifier, Status},
        testing::{loopback_fabric_pair, loopback_transport_pair},
    };
    use std::sync::atomic::AtomicUsize;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// End-to-end clean bring-up (spec.md §8 scenario 1): two connections,
    /// one per direction, linked by a loopback transport pair and a loopback
    /// fabric pair, each driven by its own full thread topology. Both sides
    /// must observe `Disconnected` then `Connected`.
    #[test]
    fn clean_bring_up_reaches_connected_on_both_sides() {
        let (sender_transport, receiver_transport) =
            loopback_transport_pair(addr(5001), addr(5002));
        let (sender_fabric, receiver_fabric) = loopback_fabric_pair();

        let sender_events = Arc::new(Mutex::new(Vec::new()));
        let receiver_events = Arc::new(Mutex::new(Vec::new()));
        let sender_connected = Arc::new(AtomicUsize::new(0));
        let receiver_connected = Arc::new(AtomicUsize::new(0));

        let sender_events_clone = sender_events.clone();
        let sender_connected_clone = sender_connected.clone();
        let sender_notifier = Arc::new(Notifier::new(move |event| {
            if event.status == Status::Connected {
                sender_connected_clone.fetch_add(1, Ordering::SeqCst);
            }
            sender_events_clone.lock().push(event.status);
        }));

        let receiver_events_clone = receiver_events.clone();
        let receiver_connected_clone = receiver_connected.clone();
        let receiver_notifier = Arc::new(Notifier::new(move |event| {
            if event.status == Status::Connected {
                receiver_connected_clone.fetch_add(1, Ordering::SeqCst);
            }
            receiver_events_clone.lock().push(event.status);
        }));

        // Real OS thread scheduling (unlike the pure-function `fsm` unit
        // tests elsewhere) needs more slack than `ProbeConfig::for_testing`'s
        // sub-5ms cadences provide, or the monitor timeout can fire before
        // the poll/control-receive threads get scheduled.
        let config = ProbeConfig {
            send_reset_frequency: Duration::from_millis(20),
            tx_command_ack_timeout: Duration::from_millis(50),
            efa_probe_monitor_timeout: Duration::from_millis(200),
            efa_tx_probe_ack_timeout: Duration::from_millis(50),
            endpoint_manager_completion_timeout: Duration::from_millis(200),
            efa_probe_packet_count: 4,
            ..ProbeConfig::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let sender_conn = Connection::new(
            sender_transport,
            8,
            sender_notifier,
            config,
            clock.clone(),
        );
        let receiver_conn = Connection::new(
            receiver_transport,
            8,
            receiver_notifier,
            config,
            clock,
        );

        sender_conn.spawn_endpoint(
            Direction::Send,
            Gid::from([1u8; 16]),
            config,
            Arc::new(Mutex::new(sender_fabric)),
            Arc::new(Pool::new(config.control_pool_capacity)),
            LocalIdentity {
                ip: "127.0.0.1".into(),
                control_port: 5001,
                stream_name: "camera-0".into(),
            },
            addr(5002),
        );
        receiver_conn.spawn_endpoint(
            Direction::Receive,
            Gid::from([2u8; 16]),
            config,
            Arc::new(Mutex::new(receiver_fabric)),
            Arc::new(Pool::new(config.control_pool_capacity)),
            LocalIdentity {
                ip: "127.0.0.1".into(),
                control_port: 5002,
                stream_name: "camera-0".into(),
            },
            addr(5001),
        );

        sender_conn.start_io_threads();
        receiver_conn.start_io_threads();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if sender_connected.load(Ordering::SeqCst) > 0
                && receiver_connected.load(Ordering::SeqCst) > 0
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(sender_connected.load(Ordering::SeqCst), 1, "sender never connected");
        assert_eq!(receiver_connected.load(Ordering::SeqCst), 1, "receiver never connected");
        assert_eq!(sender_events.lock().first(), Some(&Status::Disconnected));
        assert_eq!(receiver_events.lock().first(), Some(&Status::Disconnected));

        sender_conn.shutdown();
        receiver_conn.shutdown();
    }
}
