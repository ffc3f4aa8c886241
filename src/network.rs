//! Network demultiplexer (C4) — the imperative shell.
//!
//! One task, spawned by `NetworkHandle::spawn`, owns the adapter, the
//! `rx_id -> Connection` routing table, and the `TimerWheel` exclusively
//! (§5: "a single task owns all mutable state; no locks are needed").
//! Everything else — `Reader`/`Writer` handles, the push-view `Transport`,
//! application code opening new connections — talks to it over
//! `tokio::sync::mpsc` channels and gets out of the way.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::adapter::CanAdapter;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionEvent, Effect};
use crate::error::IsoTpError;
use crate::frame::CanFrame;
use crate::timer::TimerWheel;

type ConnId = crate::connection::ConnId;

/// N_As: how long the adapter may take to accept a frame for transmission
/// before the in-flight transfer on that connection aborts (§4.3).
const N_AS_DEFAULT: Duration = Duration::from_millis(1000);

pub(crate) enum NetworkCommand {
    OpenConnection {
        tx_id: u32,
        rx_id: u32,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        reply: oneshot::Sender<Result<ConnId, IsoTpError>>,
    },
    Write {
        conn: ConnId,
        data: Vec<u8>,
        accepted: oneshot::Sender<Result<(), IsoTpError>>,
    },
    Close {
        conn: ConnId,
    },
}

/// A cheap, cloneable handle to a running `Network` task.
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::UnboundedSender<NetworkCommand>,
}

impl NetworkHandle {
    pub(crate) async fn open_connection(
        &self,
        tx_id: u32,
        rx_id: u32,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnId, IsoTpError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NetworkCommand::OpenConnection {
                tx_id,
                rx_id,
                config,
                events,
                reply,
            })
            .map_err(|_| IsoTpError::ConnectionClosed)?;
        rx.await.map_err(|_| IsoTpError::ConnectionClosed)?
    }

    pub(crate) fn submit_write(
        &self,
        conn: ConnId,
        data: Vec<u8>,
        accepted: oneshot::Sender<Result<(), IsoTpError>>,
    ) {
        let _ = self.commands.send(NetworkCommand::Write { conn, data, accepted });
    }

    pub(crate) fn close(&self, conn: ConnId) {
        let _ = self.commands.send(NetworkCommand::Close { conn });
    }
}

struct Slot {
    conn: Connection,
    tx_id: u32,
    rx_id: u32,
    extended_id: bool,
}

/// The demultiplexer and its owned state: an adapter, a routing table keyed
/// by `(extended, rx_id)`, and a shared timer wheel.
pub struct NetworkTask<A: CanAdapter> {
    adapter: A,
    commands: mpsc::UnboundedReceiver<NetworkCommand>,
    connections: HashMap<ConnId, Slot>,
    routes: HashMap<(bool, u32), ConnId>,
    timers: TimerWheel,
    next_id: ConnId,
    /// Connections with queued writes waiting for their TX half to go idle.
    pending_tx: std::collections::VecDeque<ConnId>,
    /// Set once the adapter reports a fatal error; checked after every
    /// `select!` iteration to unwind the task (§7: "adapter errors are
    /// fatal for the network"). Kept as a message rather than an
    /// `IsoTpError` since the latter is not `Clone` and every connection
    /// being torn down needs its own copy of the reason.
    fatal: Option<String>,
}

impl<A: CanAdapter> NetworkTask<A> {
    /// Spawn the network task and return a handle to it. The task runs
    /// until the handle (and every clone of it) is dropped.
    pub fn spawn(adapter: A) -> NetworkHandle
    where
        A: 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut network = NetworkTask {
            adapter,
            commands: rx,
            connections: HashMap::new(),
            routes: HashMap::new(),
            timers: TimerWheel::new(),
            next_id: 1,
            pending_tx: std::collections::VecDeque::new(),
            fatal: None,
        };
        tokio::spawn(async move { network.run().await });
        NetworkHandle { commands: tx }
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break, // every NetworkHandle dropped
                    }
                }

                frame = self.adapter.recv() => {
                    match frame {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(err) => {
                            tracing::error!(error = %err, "CAN adapter read failed, network task stopping");
                            self.fatal = Some(err.to_string());
                            break;
                        }
                    }
                }

                expired = self.timers.next(), if !self.timers.is_empty() => {
                    if let Some((conn, kind)) = expired {
                        self.handle_timer(conn, kind).await;
                    }
                }
            }

            if self.fatal.is_some() {
                break;
            }

            self.pump_pending_writes().await;
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: NetworkCommand) {
        match cmd {
            NetworkCommand::OpenConnection {
                tx_id,
                rx_id,
                config,
                events,
                reply,
            } => {
                let result = self.open_connection(tx_id, rx_id, config, events);
                let _ = reply.send(result);
            }
            NetworkCommand::Write { conn, data, accepted } => {
                self.submit_write(conn, data, accepted).await;
            }
            NetworkCommand::Close { conn } => {
                self.close_connection(conn);
            }
        }
    }

    fn open_connection(
        &mut self,
        tx_id: u32,
        rx_id: u32,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnId, IsoTpError> {
        config.validate()?;
        let extended_id = config.resolve_extended_id(tx_id, rx_id);
        let route_key = (extended_id, rx_id);

        if self.routes.contains_key(&route_key) {
            return Err(IsoTpError::DuplicateRxId(rx_id));
        }

        let id = self.next_id;
        self.next_id += 1;

        let conn = Connection::new(id, tx_id, rx_id, extended_id, &config, events);
        self.routes.insert(route_key, id);
        self.connections.insert(
            id,
            Slot {
                conn,
                tx_id,
                rx_id,
                extended_id,
            },
        );

        tracing::debug!(conn = id, tx_id, rx_id, extended_id, "connection opened");
        Ok(id)
    }

    async fn submit_write(&mut self, conn: ConnId, data: Vec<u8>, accepted: oneshot::Sender<Result<(), IsoTpError>>) {
        let Some(slot) = self.connections.get_mut(&conn) else {
            let _ = accepted.send(Err(IsoTpError::ConnectionClosed));
            return;
        };
        let effects = slot.conn.submit_write(data, accepted);
        self.apply_effects(conn, effects).await;
    }

    fn close_connection(&mut self, conn: ConnId) {
        let reason = match &self.fatal {
            Some(msg) => IsoTpError::AdapterError(std::io::Error::new(std::io::ErrorKind::Other, msg.clone())),
            None => IsoTpError::ConnectionClosed,
        };
        if let Some(mut slot) = self.connections.remove(&conn) {
            let effects = slot.conn.close(reason);
            self.timers.cancel_all(conn);
            self.routes.remove(&(slot.extended_id, slot.rx_id));
            // effects from close() are all CancelTimer, already handled by
            // cancel_all above, so they are dropped rather than applied.
            drop(effects);
            tracing::debug!(conn, "connection closed");
        }
    }

    async fn handle_frame(&mut self, frame: CanFrame) {
        let Some(&conn_id) = self.routes.get(&frame.route_key()) else {
            return; // frame for an id nobody is listening on
        };
        let Some(slot) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let effects = slot.conn.on_frame(&frame);
        self.apply_effects(conn_id, effects).await;
    }

    async fn handle_timer(&mut self, conn: ConnId, kind: crate::timer::TimerKind) {
        let Some(slot) = self.connections.get_mut(&conn) else {
            return;
        };
        let effects = slot.conn.on_timer(kind);
        self.apply_effects(conn, effects).await;
    }

    /// Apply the side effects a connection's state transition produced:
    /// hand frames to the adapter (serializing outbound writes across every
    /// connection at frame granularity, per §4.4) and arm/cancel timers.
    async fn apply_effects(&mut self, conn: ConnId, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(frame) => {
                    match tokio::time::timeout(N_AS_DEFAULT, self.adapter.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::error!(conn, error = %err, "CAN adapter rejected a frame, network task stopping");
                            self.fatal = Some(err.to_string());
                        }
                        Err(_elapsed) => {
                            tracing::warn!(conn, "adapter did not accept frame within N_As");
                            if let Some(slot) = self.connections.get_mut(&conn) {
                                let timeout_effects = slot.conn.on_transmit_timeout();
                                for timeout_effect in timeout_effects {
                                    match timeout_effect {
                                        Effect::CancelTimer(kind) => self.timers.cancel(conn, kind),
                                        Effect::ScheduleTimer(kind, delay) => {
                                            self.timers.schedule(conn, kind, delay)
                                        }
                                        // Aborting a transmit timeout never re-sends a frame.
                                        Effect::Send(_) => {}
                                    }
                                }
                            }
                        }
                    }
                }
                Effect::ScheduleTimer(kind, delay) => self.timers.schedule(conn, kind, delay),
                Effect::CancelTimer(kind) => self.timers.cancel(conn, kind),
            }
        }
        if self.connections.get(&conn).map(|s| s.conn.tx_idle()).unwrap_or(false) {
            self.pending_tx.push_back(conn);
        }
    }

    /// After any state change, give idle TX halves a chance to pick up the
    /// next queued write (§4.2's FIFO-per-connection queue).
    async fn pump_pending_writes(&mut self) {
        while let Some(conn) = self.pending_tx.pop_front() {
            let Some(slot) = self.connections.get_mut(&conn) else {
                continue;
            };
            if let Some(pending) = slot.conn.pop_queued_write() {
                let effects = slot.conn.start_tx(pending.data, pending.accepted);
                self.apply_effects(conn, effects).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
        if let Err(err) = self.adapter.close().await {
            tracing::warn!(error = %err, "CAN adapter did not close cleanly");
        }
    }
}
