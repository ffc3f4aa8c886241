use thiserror::Error;

/// Errors surfaced to application code by the ISO-TP engine.
///
/// Per-message errors (`ProtocolError`, `SequenceError`, `FlowControlTimeout`,
/// `ReassemblyTimeout`, `FlowControlWaitOverflow`, `PeerBufferOverflow`,
/// `TransmitTimeout`) abort the in-flight message only; the connection
/// survives and the next inbound First Frame or outbound write starts a
/// fresh exchange. `ConnectionClosed` and `AdapterError` are terminal.
#[derive(Debug, Error)]
pub enum IsoTpError {
    #[error("malformed PCI or impossible framing, frame dropped")]
    ProtocolError,

    #[error("consecutive frame sequence number mismatch")]
    SequenceError,

    #[error("timed out waiting for a flow control frame (N_Bs)")]
    FlowControlTimeout,

    #[error("timed out waiting for the next consecutive frame (N_Cr)")]
    ReassemblyTimeout,

    #[error("peer sent more WAIT flow control frames than we tolerate")]
    FlowControlWaitOverflow,

    #[error("peer flow control reported buffer overflow")]
    PeerBufferOverflow,

    #[error("adapter did not accept a frame for transmission within N_As")]
    TransmitTimeout,

    #[error("rx_id {0:#x} is already bound to a connection on this network")]
    DuplicateRxId(u32),

    #[error("connection was closed")]
    ConnectionClosed,

    #[error("CAN adapter error: {0}")]
    AdapterError(#[from] std::io::Error),

    #[error("payload length {0} is outside the addressable 1..=4095 range")]
    InvalidPayloadLength(usize),

    #[error("invalid connection configuration: {0}")]
    InvalidConfiguration(&'static str),
}
