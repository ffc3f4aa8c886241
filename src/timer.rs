//! Timer service (C2): schedule one-shot deadlines keyed by connection and
//! kind, cancellable, millisecond resolution or better.
//!
//! Backed by `tokio_util::time::DelayQueue`, a timer wheel, exactly as the
//! design notes suggest. A single `TimerWheel` lives inside the network
//! task (§5's single owner) and is polled alongside the adapter and the
//! command channel in one `select!` loop; no timer ever fires outside that
//! task.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

use crate::connection::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// N_Bs: TX waiting for a flow-control frame.
    NBs,
    /// N_Cr: RX waiting for the next consecutive frame.
    NCr,
    /// STmin pacing between consecutive frames we are sending.
    StMin,
}

pub struct TimerWheel {
    queue: DelayQueue<(ConnId, TimerKind)>,
    keys: HashMap<(ConnId, TimerKind), Key>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Arm (or re-arm) a timer. Scheduling over an already-armed timer of
    /// the same kind replaces it, matching the state machine's "cancel,
    /// then restart" pattern for N_Bs/N_Cr.
    pub fn schedule(&mut self, conn: ConnId, kind: TimerKind, delay: Duration) {
        self.cancel(conn, kind);
        let key = self.queue.insert((conn, kind), delay);
        self.keys.insert((conn, kind), key);
    }

    /// Cancel a timer. A no-op if it already fired or was never armed,
    /// matching the spec's "cancellation after the callback has started is
    /// a no-op and must not wait".
    pub fn cancel(&mut self, conn: ConnId, kind: TimerKind) {
        if let Some(key) = self.keys.remove(&(conn, kind)) {
            let _ = self.queue.try_remove(&key);
        }
    }

    pub fn cancel_all(&mut self, conn: ConnId) {
        for kind in [TimerKind::NBs, TimerKind::NCr, TimerKind::StMin] {
            self.cancel(conn, kind);
        }
    }

    /// Wait for the next timer to expire. Callers must guard this with
    /// `is_empty()` in a `select!` — an empty queue resolves `Ready(None)`
    /// immediately rather than pending forever.
    pub async fn next(&mut self) -> Option<(ConnId, TimerKind)> {
        let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let item = *expired.get_ref();
        self.keys.remove(&item);
        Some(item)
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
