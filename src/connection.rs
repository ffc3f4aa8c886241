//! Connection state machine (C3) — the ISO-TP protocol engine.
//!
//! `Connection` is the functional core: every public method takes `&mut
//! self` plus whatever triggered it (an inbound frame, a write request, an
//! expired timer) and returns a `Vec<Effect>` describing what the
//! imperative shell (`Network`, in `network.rs`) must do — send a CAN
//! frame, arm or cancel a timer. `Connection` never touches the adapter or
//! the timer wheel directly, which is what makes it possible to unit test
//! the whole state machine (§8's invariants and scenarios) without a
//! runtime or an adapter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::ConnectionConfig;
use crate::error::IsoTpError;
use crate::frame::CanFrame;
use crate::pci::{self, FlowStatus, PciFrame, MAX_PAYLOAD_LEN};
use crate::timer::TimerKind;

pub type ConnId = u64;

const N_BS_DEFAULT: Duration = Duration::from_millis(1000);
const N_CR_DEFAULT: Duration = Duration::from_millis(1000);
/// Local ceiling on the number of consecutive WAIT flow-control frames a
/// peer may send us before we give up (spec: "default 10").
const WAIT_FRAME_CEILING: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    WaitFc,
    Sending,
    WaitFcAgain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    Assembling,
}

/// A side effect the connection wants the network task to perform.
#[derive(Debug)]
pub enum Effect {
    Send(CanFrame),
    ScheduleTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
}

pub(crate) struct PendingWrite {
    pub data: Vec<u8>,
    pub accepted: oneshot::Sender<Result<(), IsoTpError>>,
}

struct TxHalf {
    state: TxState,
    buf: Vec<u8>,
    cursor: usize,
    seq: u8,
    bs_peer: u8,
    stmin_peer: Duration,
    block_counter: u8,
    wait_count: u8,
    queue: VecDeque<PendingWrite>,
}

impl TxHalf {
    fn new() -> Self {
        Self {
            state: TxState::Idle,
            buf: Vec::new(),
            cursor: 0,
            seq: 1,
            bs_peer: 0,
            stmin_peer: Duration::from_millis(0),
            block_counter: 0,
            wait_count: 0,
            queue: VecDeque::new(),
        }
    }
}

struct RxHalf {
    state: RxState,
    buf: Vec<u8>,
    cursor: usize,
    total_len: usize,
    expected_seq: u8,
    block_counter: u8,
}

impl RxHalf {
    fn new() -> Self {
        Self {
            state: RxState::Idle,
            buf: Vec::new(),
            cursor: 0,
            total_len: 0,
            expected_seq: 1,
            block_counter: 0,
        }
    }
}

/// Events delivered to the application: either a reassembled payload, or a
/// per-message error. Errors here never imply the connection closed — see
/// `IsoTpError`'s docs.
pub type ConnectionEvent = Result<Vec<u8>, IsoTpError>;

/// One ISO-TP connection: an immutable descriptor plus the independent
/// TX/RX half state machines sharing it (§3).
pub struct Connection {
    pub id: ConnId,
    pub tx_id: u32,
    pub rx_id: u32,
    pub extended_id: bool,
    padding: Option<u8>,
    block_size: u8,
    st_min: u8,
    #[allow(dead_code)] // kept for API fidelity with §6; see DESIGN.md
    wftmax: u8,
    tx: TxHalf,
    rx: RxHalf,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    pub fn new(
        id: ConnId,
        tx_id: u32,
        rx_id: u32,
        extended_id: bool,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            id,
            tx_id,
            rx_id,
            extended_id,
            padding: config.padding,
            block_size: config.block_size,
            st_min: config.st_min,
            wftmax: config.wftmax,
            tx: TxHalf::new(),
            rx: RxHalf::new(),
            events,
        }
    }

    fn make_frame(&self, payload: &[u8]) -> CanFrame {
        let mut buf = payload.to_vec();
        if let Some(pad) = self.padding {
            buf.resize(8, pad);
        }
        CanFrame::new(self.tx_id, self.extended_id, &buf)
            .expect("payload within a classic CAN frame's 8 data bytes")
    }

    fn make_fc_frame(&self, status: FlowStatus) -> CanFrame {
        self.make_frame(&pci::encode_flow_control(status, self.block_size, self.st_min))
    }

    // ---------------------------------------------------------------- TX

    /// Accept a write request. If the TX half is idle and no writes are
    /// queued ahead of it, it starts transmitting immediately; otherwise
    /// it joins the FIFO queue behind the in-flight payload (invariant 1).
    pub fn submit_write(
        &mut self,
        data: Vec<u8>,
        accepted: oneshot::Sender<Result<(), IsoTpError>>,
    ) -> Vec<Effect> {
        if data.is_empty() || data.len() > MAX_PAYLOAD_LEN {
            let _ = accepted.send(Err(IsoTpError::InvalidPayloadLength(data.len())));
            return Vec::new();
        }

        if self.tx.state == TxState::Idle && self.tx.queue.is_empty() {
            self.start_tx(data, accepted)
        } else {
            self.tx.queue.push_back(PendingWrite { data, accepted });
            Vec::new()
        }
    }

    pub fn tx_idle(&self) -> bool {
        self.tx.state == TxState::Idle
    }

    pub fn pop_queued_write(&mut self) -> Option<PendingWrite> {
        if self.tx_idle() {
            self.tx.queue.pop_front()
        } else {
            None
        }
    }

    /// Begin transmitting `data`, firing `accepted` now that it has been
    /// handed to the state machine (this is what `Writer::drain` awaits).
    pub fn start_tx(
        &mut self,
        data: Vec<u8>,
        accepted: oneshot::Sender<Result<(), IsoTpError>>,
    ) -> Vec<Effect> {
        let _ = accepted.send(Ok(()));
        let mut effects = Vec::new();

        if data.len() <= 7 {
            effects.push(Effect::Send(self.make_frame(&pci::encode_single_frame(&data))));
            self.tx.state = TxState::Idle;
        } else {
            let total_len = data.len() as u16;
            effects.push(Effect::Send(
                self.make_frame(&pci::encode_first_frame(total_len, &data[..6])),
            ));
            self.tx.buf = data;
            self.tx.cursor = 6;
            self.tx.seq = 1;
            self.tx.wait_count = 0;
            self.tx.state = TxState::WaitFc;
            effects.push(Effect::ScheduleTimer(TimerKind::NBs, N_BS_DEFAULT));
        }

        effects
    }

    fn abort_tx(&mut self, err: IsoTpError, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelTimer(TimerKind::NBs));
        effects.push(Effect::CancelTimer(TimerKind::StMin));
        let _ = self.events.send(Err(err));
        self.tx.state = TxState::Idle;
        self.tx.buf.clear();
    }

    fn send_next_cf(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let remaining = self.tx.buf.len() - self.tx.cursor;
        let chunk_len = remaining.min(7);
        let chunk = self.tx.buf[self.tx.cursor..self.tx.cursor + chunk_len].to_vec();

        effects.push(Effect::Send(
            self.make_frame(&pci::encode_consecutive_frame(self.tx.seq, &chunk)),
        ));
        self.tx.cursor += chunk_len;
        self.tx.seq = (self.tx.seq + 1) % 16;
        self.tx.block_counter += 1;

        if self.tx.cursor >= self.tx.buf.len() {
            self.tx.state = TxState::Idle;
            self.tx.buf.clear();
        } else if self.tx.bs_peer != 0 && self.tx.block_counter >= self.tx.bs_peer {
            self.tx.state = TxState::WaitFcAgain;
            effects.push(Effect::ScheduleTimer(TimerKind::NBs, N_BS_DEFAULT));
        } else {
            effects.push(Effect::ScheduleTimer(TimerKind::StMin, self.tx.stmin_peer));
        }

        effects
    }

    fn on_flow_control(&mut self, status: FlowStatus, bs: u8, st_min_raw: u8) -> Vec<Effect> {
        let mut effects = Vec::new();

        match self.tx.state {
            TxState::WaitFc | TxState::WaitFcAgain => {
                effects.push(Effect::CancelTimer(TimerKind::NBs));
                match status {
                    FlowStatus::ContinueToSend => {
                        self.tx.bs_peer = bs;
                        self.tx.stmin_peer = pci::decode_st_min(st_min_raw);
                        self.tx.block_counter = 0;
                        self.tx.wait_count = 0;
                        self.tx.state = TxState::Sending;
                        effects.extend(self.send_next_cf());
                    }
                    FlowStatus::Wait => {
                        self.tx.wait_count += 1;
                        if self.tx.wait_count > WAIT_FRAME_CEILING {
                            self.abort_tx(IsoTpError::FlowControlWaitOverflow, &mut effects);
                        } else {
                            effects.push(Effect::ScheduleTimer(TimerKind::NBs, N_BS_DEFAULT));
                        }
                    }
                    FlowStatus::Overflow => {
                        self.abort_tx(IsoTpError::PeerBufferOverflow, &mut effects);
                    }
                }
            }
            // FC arriving while TX is idle: silently dropped.
            TxState::Idle | TxState::Sending => {}
        }

        effects
    }

    // ---------------------------------------------------------------- RX

    fn on_single_frame(&mut self, data: &[u8]) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.rx.state == RxState::Assembling {
            // A new message supersedes a partial one (§4.3's restart rule).
            effects.push(Effect::CancelTimer(TimerKind::NCr));
            self.rx.state = RxState::Idle;
            self.rx.buf.clear();
        }
        let _ = self.events.send(Ok(data.to_vec()));
        effects
    }

    fn on_first_frame(&mut self, total_len: u16, first: &[u8]) -> Vec<Effect> {
        let mut effects = Vec::new();

        if total_len as usize > MAX_PAYLOAD_LEN {
            let _ = self.events.send(Err(IsoTpError::ProtocolError));
            return effects;
        }

        if self.rx.state == RxState::Assembling {
            effects.push(Effect::CancelTimer(TimerKind::NCr));
        }

        self.rx.buf = vec![0u8; total_len as usize];
        self.rx.buf[..first.len()].copy_from_slice(first);
        self.rx.cursor = first.len();
        self.rx.total_len = total_len as usize;
        self.rx.expected_seq = 1;
        self.rx.block_counter = 0;
        self.rx.state = RxState::Assembling;

        // The reassembly buffer is always pre-sized and ready, so this
        // implementation never needs to stall a sender with FC.WAIT on the
        // receive path; see DESIGN.md for the open-question resolution.
        effects.push(Effect::Send(self.make_fc_frame(FlowStatus::ContinueToSend)));
        effects.push(Effect::ScheduleTimer(TimerKind::NCr, N_CR_DEFAULT));
        effects
    }

    fn on_consecutive_frame(&mut self, seq: u8, data: &[u8]) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.rx.state != RxState::Assembling {
            // Stale CF, silently dropped.
            return effects;
        }

        if seq != self.rx.expected_seq {
            effects.push(Effect::CancelTimer(TimerKind::NCr));
            self.rx.state = RxState::Idle;
            self.rx.buf.clear();
            let _ = self.events.send(Err(IsoTpError::SequenceError));
            return effects;
        }

        let remaining = self.rx.total_len - self.rx.cursor;
        let take = remaining.min(data.len()).min(7);
        self.rx.buf[self.rx.cursor..self.rx.cursor + take].copy_from_slice(&data[..take]);
        self.rx.cursor += take;
        self.rx.expected_seq = (self.rx.expected_seq + 1) % 16;
        self.rx.block_counter += 1;

        if self.rx.cursor >= self.rx.total_len {
            effects.push(Effect::CancelTimer(TimerKind::NCr));
            self.rx.state = RxState::Idle;
            let payload = std::mem::take(&mut self.rx.buf);
            let _ = self.events.send(Ok(payload));
        } else {
            if self.block_size != 0 && self.rx.block_counter >= self.block_size {
                self.rx.block_counter = 0;
                effects.push(Effect::Send(self.make_fc_frame(FlowStatus::ContinueToSend)));
            }
            effects.push(Effect::ScheduleTimer(TimerKind::NCr, N_CR_DEFAULT));
        }

        effects
    }

    // ------------------------------------------------------------ dispatch

    pub fn on_frame(&mut self, frame: &CanFrame) -> Vec<Effect> {
        match pci::decode(frame.data()) {
            Ok(PciFrame::Single(data)) => self.on_single_frame(data),
            Ok(PciFrame::First { total_len, data }) => self.on_first_frame(total_len, data),
            Ok(PciFrame::Consecutive { seq, data }) => self.on_consecutive_frame(seq, data),
            Ok(PciFrame::FlowControl { status, bs, st_min }) => {
                self.on_flow_control(status, bs, st_min)
            }
            Err(()) => {
                tracing::warn!(tx_id = self.tx_id, rx_id = self.rx_id, "malformed ISO-TP frame dropped");
                let _ = self.events.send(Err(IsoTpError::ProtocolError));
                Vec::new()
            }
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind) -> Vec<Effect> {
        match kind {
            TimerKind::NBs => {
                let mut effects = Vec::new();
                if matches!(self.tx.state, TxState::WaitFc | TxState::WaitFcAgain) {
                    self.abort_tx(IsoTpError::FlowControlTimeout, &mut effects);
                }
                effects
            }
            TimerKind::NCr => {
                let mut effects = Vec::new();
                if self.rx.state == RxState::Assembling {
                    self.rx.state = RxState::Idle;
                    self.rx.buf.clear();
                    let _ = self.events.send(Err(IsoTpError::ReassemblyTimeout));
                }
                effects
            }
            TimerKind::StMin => {
                if self.tx.state == TxState::Sending {
                    self.send_next_cf()
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Abort the in-flight transfer after the adapter failed to accept a
    /// frame within N_As (§4.3: "aborts with `TransmitTimeout`"). Mirrors
    /// every other TX abort path: timers are cancelled and the TX half
    /// returns to `Idle` so the connection is immediately usable again,
    /// rather than left stuck until an unrelated timer incidentally fires.
    pub fn on_transmit_timeout(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.abort_tx(IsoTpError::TransmitTimeout, &mut effects);
        effects
    }

    /// Tear the connection down: cancel timers, fail queued writes, and
    /// deliver `reason` as the final event (invariant: pending writes fail
    /// with `ConnectionClosed`, any in-progress RX buffer is discarded).
    pub fn close(&mut self, reason: IsoTpError) -> Vec<Effect> {
        while let Some(pending) = self.tx.queue.pop_front() {
            let _ = pending.accepted.send(Err(IsoTpError::ConnectionClosed));
        }
        self.tx.state = TxState::Idle;
        self.tx.buf.clear();
        self.rx.state = RxState::Idle;
        self.rx.buf.clear();
        let _ = self.events.send(Err(reason));
        vec![
            Effect::CancelTimer(TimerKind::NBs),
            Effect::CancelTimer(TimerKind::NCr),
            Effect::CancelTimer(TimerKind::StMin),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_conn(events: mpsc::UnboundedSender<ConnectionEvent>) -> Connection {
        Connection::new(1, 0x100, 0x100, false, &ConnectionConfig::default(), events)
    }

    #[test]
    fn s1_short_payload_becomes_padded_single_frame() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = new_conn(tx);
        conn.padding = Some(0xCC);

        let (acc_tx, _acc_rx) = oneshot::channel();
        let effects = conn.submit_write(b"hi".to_vec(), acc_tx);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Send(frame) => {
                assert_eq!(frame.id(), 0x100);
                assert_eq!(frame.data(), &[0x02, 0x68, 0x69, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
            }
            _ => panic!("expected a Send effect"),
        }
    }

    #[test]
    fn s2_long_payload_emits_first_frame_then_cancels_on_seq_reset() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = new_conn(tx);

        let data: Vec<u8> = (0u8..20).collect();
        let (acc_tx, _acc_rx) = oneshot::channel();
        let effects = conn.submit_write(data, acc_tx);

        assert_eq!(effects.len(), 2);
        match &effects[0] {
            Effect::Send(frame) => {
                assert_eq!(frame.data(), &[0x10, 0x14, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
            }
            _ => panic!("expected FF send"),
        }
        assert!(matches!(effects[1], Effect::ScheduleTimer(TimerKind::NBs, _)));

        let fc = CanFrame::new(0x100, false, &[0x30, 0x00, 0x00]).unwrap();
        let effects = conn.on_frame(&fc);
        // CancelTimer(NBs) + two CFs, each possibly followed by a StMin schedule.
        let sends: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(f) => Some(*f),
                _ => None,
            })
            .collect();
        assert_eq!(sends[0].data(), &[0x21, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn sequence_error_aborts_reassembly_without_closing_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = new_conn(tx);

        let ff = CanFrame::new(0x100, false, &[0x10, 0x0A, 1, 2, 3, 4, 5, 6]).unwrap();
        conn.on_frame(&ff);

        let bad_cf = CanFrame::new(0x100, false, &[0x23, 7, 8, 9]).unwrap();
        conn.on_frame(&bad_cf);
        assert!(matches!(rx.try_recv(), Ok(Err(IsoTpError::SequenceError))));

        // A fresh FF should assemble cleanly afterwards.
        let ff2 = CanFrame::new(0x100, false, &[0x10, 0x08, 1, 2, 3, 4, 5, 6]).unwrap();
        conn.on_frame(&ff2);
        let cf = CanFrame::new(0x100, false, &[0x21, 7, 8]).unwrap();
        conn.on_frame(&cf);
        assert!(matches!(rx.try_recv(), Ok(Ok(payload)) if payload == vec![1,2,3,4,5,6,7,8]));
    }

    #[test]
    fn reassembly_timeout_does_not_close_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = new_conn(tx);

        let ff = CanFrame::new(0x100, false, &[0x10, 0x0A, 1, 2, 3, 4, 5, 6]).unwrap();
        conn.on_frame(&ff);
        conn.on_timer(TimerKind::NCr);
        assert!(matches!(rx.try_recv(), Ok(Err(IsoTpError::ReassemblyTimeout))));

        let ff2 = CanFrame::new(0x100, false, &[0x10, 0x08, 1, 2, 3, 4, 5, 6]).unwrap();
        conn.on_frame(&ff2);
        let cf = CanFrame::new(0x100, false, &[0x21, 7, 8]).unwrap();
        conn.on_frame(&cf);
        assert!(matches!(rx.try_recv(), Ok(Ok(_))));
    }

    #[test]
    fn close_fails_queued_writes_with_connection_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = new_conn(tx);

        let (acc1, _r1) = oneshot::channel();
        conn.submit_write(vec![0; 20], acc1); // occupies TX, goes to WaitFc

        let (acc2, r2) = oneshot::channel();
        conn.submit_write(vec![1, 2, 3], acc2); // queued behind it

        conn.close(IsoTpError::ConnectionClosed);
        assert!(matches!(r2.try_recv(), Ok(Err(IsoTpError::ConnectionClosed))));
    }

    #[test]
    fn cf_sequence_wraps_from_15_to_0() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = new_conn(tx);
        conn.tx.seq = 15;
        conn.tx.buf = vec![0u8; 14];
        conn.tx.cursor = 0;
        conn.tx.state = TxState::Sending;
        conn.tx.bs_peer = 0;
        conn.tx.stmin_peer = Duration::from_millis(0);

        let effects = conn.send_next_cf();
        match &effects[0] {
            Effect::Send(frame) => assert_eq!(frame.data()[0] & 0x0F, 15),
            _ => panic!(),
        }
        let effects = conn.send_next_cf();
        match &effects[0] {
            Effect::Send(frame) => assert_eq!(frame.data()[0] & 0x0F, 0),
            _ => panic!(),
        }
    }
}
