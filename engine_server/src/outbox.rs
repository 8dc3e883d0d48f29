// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::bus::{BusError, EventSink};
use core_protocol::event::{DisconnectReason, OutboundEvent, TextKind};
use core_protocol::id::SessionId;
use log::warn;
use std::collections::HashSet;

/// The engine's writing end of the outbound bus. Prompts are gathered per
/// tick and emitted once per session at flush, after all other output, so a
/// session never sees two prompts back to back.
pub struct Outbox {
    sink: Box<dyn EventSink<OutboundEvent>>,
    pending_prompts: HashSet<SessionId>,
    /// Events refused by a full queue since startup.
    pub dropped: u64,
}

impl Outbox {
    pub fn new(sink: Box<dyn EventSink<OutboundEvent>>) -> Self {
        Self {
            sink,
            pending_prompts: HashSet::new(),
            dropped: 0,
        }
    }

    pub fn send(&mut self, event: OutboundEvent) {
        match self.sink.publish(event) {
            Ok(()) => {}
            Err(BusError::Full) => {
                // The transport layer is responsible for disconnecting a
                // session that stays backed up; the engine just counts.
                self.dropped += 1;
            }
            Err(BusError::Closed) => {
                self.dropped += 1;
                warn!("outbound bus closed");
            }
        }
    }

    pub fn line(&mut self, session_id: SessionId, text: impl Into<String>) {
        self.send(OutboundEvent::SendText {
            session_id,
            text: text.into(),
            kind: TextKind::Line,
        });
    }

    pub fn info(&mut self, session_id: SessionId, text: impl Into<String>) {
        self.send(OutboundEvent::SendText {
            session_id,
            text: text.into(),
            kind: TextKind::Info,
        });
    }

    pub fn error(&mut self, session_id: SessionId, text: impl Into<String>) {
        self.send(OutboundEvent::SendText {
            session_id,
            text: text.into(),
            kind: TextKind::Error,
        });
    }

    pub fn prompt(&mut self, session_id: SessionId) {
        self.pending_prompts.insert(session_id);
    }

    pub fn close(&mut self, session_id: SessionId, reason: DisconnectReason) {
        self.pending_prompts.remove(&session_id);
        self.send(OutboundEvent::Close { session_id, reason });
    }

    pub fn gmcp(&mut self, session_id: SessionId, package: &str, data: Vec<u8>) {
        self.send(OutboundEvent::GmcpData {
            session_id,
            package: package.to_owned(),
            data,
        });
    }

    /// End-of-tick: emit at most one prompt per session.
    pub fn flush_prompts(&mut self) {
        let pending = std::mem::take(&mut self.pending_prompts);
        for session_id in pending {
            self.send(OutboundEvent::SendPrompt { session_id });
        }
    }

    /// Forget a session that is gone (disconnect or handoff commit).
    pub fn forget(&mut self, session_id: SessionId) {
        self.pending_prompts.remove(&session_id);
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Captures everything the engine emits, for assertions.
    #[derive(Clone, Default)]
    pub struct CapturedOutbound(pub Arc<Mutex<Vec<OutboundEvent>>>);

    impl EventSink<OutboundEvent> for CapturedOutbound {
        fn publish(&self, event: OutboundEvent) -> Result<(), BusError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl CapturedOutbound {
        pub fn take(&self) -> Vec<OutboundEvent> {
            std::mem::take(&mut self.0.lock().unwrap())
        }

        pub fn lines_for(&self, session_id: SessionId) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    OutboundEvent::SendText {
                        session_id: sid,
                        text,
                        ..
                    } if *sid == session_id => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn prompt_count_for(&self, session_id: SessionId) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| {
                    matches!(e, OutboundEvent::SendPrompt { session_id: sid } if *sid == session_id)
                })
                .count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CapturedOutbound;
    use super::*;
    use core_protocol::id::LeaseId;

    fn sid(n: u16) -> SessionId {
        SessionId::compose(1_000, LeaseId::default(), n).unwrap()
    }

    #[test]
    fn prompts_coalesce_within_a_flush() {
        let captured = CapturedOutbound::default();
        let mut outbox = Outbox::new(Box::new(captured.clone()));
        outbox.line(sid(1), "one");
        outbox.prompt(sid(1));
        outbox.prompt(sid(1));
        outbox.prompt(sid(2));
        outbox.flush_prompts();

        assert_eq!(captured.prompt_count_for(sid(1)), 1);
        assert_eq!(captured.prompt_count_for(sid(2)), 1);
        outbox.flush_prompts();
        assert_eq!(captured.prompt_count_for(sid(1)), 1);
    }
}
