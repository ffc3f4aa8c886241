//! Application surface (C5), push view: a `Protocol` trait plus the driver
//! task that feeds it from a connection's event stream.
//!
//! Mirrors asyncio's transport/protocol duality that the ISO-TP reference
//! implementation is built on: the application supplies a factory producing
//! a fresh `Protocol` per connection, and the driver calls `connection_made`
//! once, `data_received` for every reassembled payload, and
//! `connection_lost` exactly once when the connection goes away.

use tokio::sync::mpsc;

use crate::connection::{ConnId, ConnectionEvent};
use crate::error::IsoTpError;
use crate::network::NetworkHandle;

/// Application-implemented handler for one connection's lifecycle.
///
/// `data_received` is called once per reassembled payload, in
/// receive-completion order. Per-message errors (`SequenceError`,
/// `ReassemblyTimeout`, …) do not tear the connection down, so they are not
/// routed through `connection_lost`; the default `on_error` hook logs and
/// ignores them, and implementors may override it to observe aborted
/// transfers.
pub trait Protocol: Send {
    fn connection_made(&mut self, _transport: &Transport) {}

    fn data_received(&mut self, data: Vec<u8>);

    /// A per-message error aborted the in-flight transfer; the connection
    /// itself survives. Default: log and ignore.
    fn on_error(&mut self, err: IsoTpError) {
        tracing::warn!(error = %err, "isotp connection reported a per-message error");
    }

    /// The connection was torn down; `reason` is `Ok(())` on a clean local
    /// close, or the fatal error that ended it.
    fn connection_lost(&mut self, _reason: Result<(), IsoTpError>) {}
}

/// The write-capable handle a `Protocol` is given at `connection_made` and
/// may retain to send payloads for the lifetime of the connection.
#[derive(Clone)]
pub struct Transport {
    writer_conn: ConnId,
    network: NetworkHandle,
}

impl Transport {
    pub(crate) fn new(conn: ConnId, network: NetworkHandle) -> Self {
        Self {
            writer_conn: conn,
            network,
        }
    }

    pub fn write(&self, data: Vec<u8>) {
        let (accepted, _rx) = tokio::sync::oneshot::channel();
        self.network.submit_write(self.writer_conn, data, accepted);
    }

    pub fn close(&self) {
        self.network.close(self.writer_conn);
    }
}

/// Drive `protocol` from `events` until the connection closes. Spawned once
/// per connection by `Network::create_connection`.
pub(crate) async fn drive<P: Protocol + 'static>(
    mut protocol: P,
    transport: Transport,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    protocol.connection_made(&transport);

    let reason = loop {
        match events.recv().await {
            Some(Ok(payload)) => protocol.data_received(payload),
            Some(Err(IsoTpError::ConnectionClosed)) => break Ok(()),
            Some(Err(err @ IsoTpError::AdapterError(_))) => break Err(err),
            Some(Err(err)) => protocol.on_error(err),
            None => break Ok(()),
        }
    };

    protocol.connection_lost(reason);
}
