// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::event::{DisconnectReason, TextKind};
use core_protocol::id::{LeaseId, SessionId};
use core_protocol::UnixTime;
use log::warn;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Allocates composite session ids under this gateway's lease.
///
/// Counter exhaustion within one millisecond spins until the next; a clock
/// that moved backward stalls allocation until real time catches up again.
/// Drift beyond the configured threshold invalidates the lease outright.
pub struct SessionAllocator {
    lease: LeaseId,
    max_rollback_ms: u64,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    last_ms: UnixTime,
    counter: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// Clock moved back further than the tolerance; the lease cannot be
    /// trusted any more and the process should exit.
    LeaseInvalidated { rollback_ms: u64 },
}

impl SessionAllocator {
    pub fn new(lease: LeaseId, max_rollback_ms: u64) -> Self {
        Self {
            lease,
            max_rollback_ms,
            state: Mutex::new(AllocatorState {
                last_ms: 0,
                counter: 0,
            }),
        }
    }

    /// Last issued (millisecond, counter) pair, for diagnostics.
    pub fn snapshot(&self) -> (UnixTime, u16) {
        let state = self.state.lock().unwrap();
        (state.last_ms, state.counter)
    }

    pub fn allocate(&self, mut now_ms: impl FnMut() -> UnixTime) -> Result<SessionId, AllocError> {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = now_ms();
            if now < state.last_ms {
                let rollback = state.last_ms - now;
                if rollback > self.max_rollback_ms {
                    return Err(AllocError::LeaseInvalidated {
                        rollback_ms: rollback,
                    });
                }
                // Stall until time catches up with the last issue.
                std::hint::spin_loop();
                continue;
            }
            if now == state.last_ms {
                if state.counter >= SessionId::MAX_COUNTER {
                    // Counter exhausted for this millisecond.
                    std::hint::spin_loop();
                    continue;
                }
                state.counter += 1;
            } else {
                state.last_ms = now;
                state.counter = 0;
            }
            if let Some(id) = SessionId::compose(state.last_ms, self.lease, state.counter) {
                return Ok(id);
            }
            // Composite of zero: only possible at epoch 0 with counter 0.
            state.counter += 1;
        }
    }
}

/// One frame bound for a client, after the engine's outbound event has been
/// routed to its session.
#[derive(Clone, Debug)]
pub enum SessionFrame {
    Text { text: String, kind: TextKind },
    Prompt,
    Gmcp { package: String, data: Vec<u8> },
    SetAnsi(bool),
    ClearScreen,
    ShowLoginScreen,
    ShowAnsiDemo,
    Close(DisconnectReason),
}

impl SessionFrame {
    /// Coalescible frames may be dropped under backpressure.
    pub fn is_coalescible(&self) -> bool {
        matches!(self, Self::Prompt)
    }
}

struct SessionEntry {
    tx: mpsc::Sender<SessionFrame>,
    overflow_since: Option<Instant>,
    /// Negotiated capabilities, cached per session.
    pub ansi: bool,
    pub gmcp: bool,
}

/// Live sessions and their bounded outbound queues. Shared by listeners
/// (register/unregister) and the outbound pump (deliver).
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    grace: Duration,
}

/// Verdict of a delivery attempt, for the pump's bookkeeping.
#[derive(Debug, Eq, PartialEq)]
pub enum Delivery {
    Sent,
    /// Coalescible frame dropped under pressure.
    Dropped,
    /// Queue stayed full past the grace period; session should die.
    Overflowed,
    UnknownSession,
}

impl SessionRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            grace,
        }
    }

    pub fn register(
        &self,
        session_id: SessionId,
        tx: mpsc::Sender<SessionFrame>,
        ansi: bool,
    ) {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions
            .insert(
                session_id,
                SessionEntry {
                    tx,
                    overflow_since: None,
                    ansi,
                    gmcp: false,
                },
            )
            .is_some()
        {
            warn!("session {} registered twice", session_id);
        }
    }

    pub fn unregister(&self, session_id: SessionId) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    pub fn set_gmcp(&self, session_id: SessionId, enabled: bool) {
        if let Some(entry) = self.sessions.lock().unwrap().get_mut(&session_id) {
            entry.gmcp = enabled;
        }
    }

    pub fn gmcp_enabled(&self, session_id: SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .map(|e| e.gmcp)
            .unwrap_or(false)
    }

    pub fn set_ansi(&self, session_id: SessionId, enabled: bool) {
        if let Some(entry) = self.sessions.lock().unwrap().get_mut(&session_id) {
            entry.ansi = enabled;
        }
    }

    /// Renderers consult this before colorizing.
    pub fn ansi_enabled(&self, session_id: SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .map(|e| e.ansi)
            .unwrap_or(false)
    }

    /// Non-blocking enqueue honoring the backpressure contract: coalescible
    /// frames drop, anything else starts (or continues) the grace window.
    pub fn deliver(&self, session_id: SessionId, frame: SessionFrame) -> Delivery {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(entry) = sessions.get_mut(&session_id) else {
            return Delivery::UnknownSession;
        };
        match entry.tx.try_send(frame) {
            Ok(()) => {
                entry.overflow_since = None;
                Delivery::Sent
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if frame.is_coalescible() {
                    return Delivery::Dropped;
                }
                let since = *entry.overflow_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.grace {
                    Delivery::Overflowed
                } else {
                    Delivery::Dropped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::UnknownSession,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn allocator_is_monotonic_and_unique() {
        let allocator = SessionAllocator::new(LeaseId::new(3).unwrap(), 5_000);
        let clock = AtomicU64::new(1_000);
        let mut previous = None;
        for i in 0..100 {
            if i % 10 == 0 {
                clock.fetch_add(1, Ordering::Relaxed);
            }
            let id = allocator
                .allocate(|| clock.load(Ordering::Relaxed))
                .unwrap();
            if let Some(previous) = previous {
                assert!(id > previous, "ids must be strictly increasing");
            }
            previous = Some(id);
        }
    }

    #[test]
    fn rollback_beyond_tolerance_invalidates_lease() {
        let allocator = SessionAllocator::new(LeaseId::default(), 1_000);
        allocator.allocate(|| 100_000).unwrap();
        assert_eq!(
            allocator.allocate(|| 50_000),
            Err(AllocError::LeaseInvalidated {
                rollback_ms: 50_000
            })
        );
    }

    #[test]
    fn small_rollback_stalls_until_caught_up() {
        let allocator = SessionAllocator::new(LeaseId::default(), 1_000);
        allocator.allocate(|| 10_000).unwrap();
        // Clock reads 9_999 then recovers; allocation succeeds once caught up.
        let reads = AtomicU64::new(0);
        let id = allocator
            .allocate(|| {
                if reads.fetch_add(1, Ordering::Relaxed) < 3 {
                    9_999
                } else {
                    10_001
                }
            })
            .unwrap();
        assert_eq!(id.timestamp_ms(), 10_001);
    }

    #[test]
    fn counter_exhaustion_waits_for_next_millisecond() {
        let allocator = SessionAllocator::new(LeaseId::default(), 1_000);
        let reads = AtomicU64::new(0);
        for _ in 0..=SessionId::MAX_COUNTER {
            allocator.allocate(|| 77).unwrap();
        }
        let id = allocator
            .allocate(|| {
                // Stays in ms 77 for a few polls, then advances.
                if reads.fetch_add(1, Ordering::Relaxed) < 3 {
                    77
                } else {
                    78
                }
            })
            .unwrap();
        assert_eq!(id.timestamp_ms(), 78);
        assert_eq!(id.counter(), 0);
    }

    #[tokio::test]
    async fn backpressure_drops_prompts_first() {
        let registry = SessionRegistry::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(2);
        let session_id = SessionId::compose(1_000, LeaseId::default(), 1).unwrap();
        registry.register(session_id, tx, true);

        assert_eq!(
            registry.deliver(session_id, SessionFrame::Prompt),
            Delivery::Sent
        );
        assert_eq!(
            registry.deliver(
                session_id,
                SessionFrame::Text {
                    text: "hello".to_owned(),
                    kind: TextKind::Line
                }
            ),
            Delivery::Sent
        );
        // Queue is now full: prompts drop quietly.
        assert_eq!(
            registry.deliver(session_id, SessionFrame::Prompt),
            Delivery::Dropped
        );
        // Draining restores delivery.
        rx.recv().await.unwrap();
        assert_eq!(
            registry.deliver(session_id, SessionFrame::Prompt),
            Delivery::Sent
        );
    }

    #[tokio::test]
    async fn overflow_past_grace_reports_disconnect() {
        let registry = SessionRegistry::new(Duration::ZERO);
        let (tx, _rx) = mpsc::channel(1);
        let session_id = SessionId::compose(1_000, LeaseId::default(), 1).unwrap();
        registry.register(session_id, tx, true);

        registry.deliver(
            session_id,
            SessionFrame::Text {
                text: "a".to_owned(),
                kind: TextKind::Line,
            },
        );
        // Grace of zero: a second non-coalescible frame overflows at once.
        assert_eq!(
            registry.deliver(
                session_id,
                SessionFrame::Text {
                    text: "b".to_owned(),
                    kind: TextKind::Line
                }
            ),
            Delivery::Overflowed
        );
    }
}
