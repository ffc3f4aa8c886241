//! Application surface (C5), pull view: `Reader`/`Writer` over one
//! connection, in the spirit of the teacher crate's duplex `CANSocket`
//! handle but split into two thin views of the same underlying state, per
//! the design notes' "explicit duplex handle" resolution.

use tokio::sync::{mpsc, oneshot};

use crate::connection::{ConnId, ConnectionEvent};
use crate::error::IsoTpError;
use crate::network::NetworkHandle;

/// The pull-style read half of a connection. Each `read()` call yields the
/// next complete, reassembled ISO-TP payload; message boundaries are always
/// preserved (one payload in, one payload out), matching invariant 1.
pub struct Reader {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Reader {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        Self { events }
    }

    /// Await the next complete payload. `max` is advisory only: a payload
    /// longer than `max` is still returned whole, per §4.5.
    ///
    /// Per-message errors (`SequenceError`, `ReassemblyTimeout`, …) surface
    /// here without closing the connection; the next First Frame starts a
    /// fresh reassembly. Returns `None` once the connection is closed and no
    /// further events will arrive.
    pub async fn read(&mut self, _max: usize) -> Option<Result<Vec<u8>, IsoTpError>> {
        self.events.recv().await
    }
}

/// The pull-style write half of a connection. `write` enqueues a payload
/// behind any in-flight transfer on this connection (FIFO, invariant 1);
/// `drain` resolves once the state machine has accepted it, i.e. handed it
/// to the TX half (not once the peer has fully received it).
pub struct Writer {
    conn: ConnId,
    network: NetworkHandle,
}

impl Writer {
    pub(crate) fn new(conn: ConnId, network: NetworkHandle) -> Self {
        Self { conn, network }
    }

    /// Enqueue `data` for transmission and return a handle that resolves
    /// once the write has been accepted (or rejected) by the connection.
    pub fn write(&self, data: Vec<u8>) -> PendingWrite {
        let (accepted, rx) = oneshot::channel();
        self.network.submit_write(self.conn, data, accepted);
        PendingWrite { rx }
    }

    pub fn close(&self) {
        self.network.close(self.conn);
    }
}

/// Returned by [`Writer::write`]; `await` it (or call [`PendingWrite::drain`])
/// to learn whether the payload was accepted.
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<(), IsoTpError>>,
}

impl PendingWrite {
    pub async fn drain(self) -> Result<(), IsoTpError> {
        self.rx.await.map_err(|_| IsoTpError::ConnectionClosed)?
    }
}
