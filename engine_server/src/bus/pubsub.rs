// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pub/sub bus: every event is sealed in an authenticated envelope and
//! fanned out on a topic. Receivers drop anything unverifiable and never
//! redeliver a node's own messages back to it.

use core_protocol::bus::{BusError, EventSink, LocalSender};
use core_protocol::envelope::{Envelope, EnvelopeError};
use core_protocol::event::{InboundEvent, InterEngineEvent, OutboundEvent};
use core_protocol::get_unix_time_now;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use server_util::broker::TopicBroker;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable per-variant tags, the wire contract for envelope filtering.
pub trait WireEvent: Serialize + DeserializeOwned + Send + 'static {
    fn type_tag(&self) -> &'static str;
}

impl WireEvent for InboundEvent {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "Connected",
            Self::Disconnected { .. } => "Disconnected",
            Self::LineReceived { .. } => "LineReceived",
            Self::GmcpReceived { .. } => "GmcpReceived",
            Self::LoginCompleted { .. } => "LoginCompleted",
        }
    }
}

impl WireEvent for OutboundEvent {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::SendText { .. } => "SendText",
            Self::SendPrompt { .. } => "SendPrompt",
            Self::ShowLoginScreen { .. } => "ShowLoginScreen",
            Self::SetAnsi { .. } => "SetAnsi",
            Self::ClearScreen { .. } => "ClearScreen",
            Self::ShowAnsiDemo { .. } => "ShowAnsiDemo",
            Self::Close { .. } => "Close",
            Self::SessionRedirect { .. } => "SessionRedirect",
            Self::GmcpData { .. } => "GmcpData",
        }
    }
}

impl WireEvent for InterEngineEvent {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::RoutedInbound { .. } => "RoutedInbound",
            Self::RoutedOutbound { .. } => "RoutedOutbound",
            Self::HandoffPrepare(_) => "HandoffPrepare",
            Self::HandoffAck { .. } => "HandoffAck",
            Self::HandoffReject { .. } => "HandoffReject",
            Self::HandoffCommit { .. } => "HandoffCommit",
            Self::CrossEngineTell { .. } => "CrossEngineTell",
            Self::ScaleDecision { .. } => "ScaleDecision",
        }
    }
}

/// Dropped-message accounting; authentication failures are silent apart
/// from these counters.
#[derive(Default)]
pub struct PubSubCounters {
    pub delivered: AtomicU64,
    pub mac_failures: AtomicU64,
    pub stale: AtomicU64,
    pub undecodable: AtomicU64,
}

/// Seals a typed event for any authenticated transport: the topic fan-out
/// below, or the sealed frames engine peers exchange over RPC.
pub fn seal_event<T: WireEvent>(event: &T, source: &str, secret: &[u8]) -> Option<Envelope> {
    match bincode::serialize(event) {
        Ok(payload) => Some(Envelope::seal(
            event.type_tag(),
            source,
            get_unix_time_now(),
            payload,
            secret,
        )),
        Err(e) => {
            warn!("envelope encode failed: {}", e);
            None
        }
    }
}

/// Verifies and decodes a sealed event. Failures never crash the receiver;
/// they only move a counter.
pub fn open_event<T: WireEvent>(
    envelope: &Envelope,
    secret: &[u8],
    max_skew_ms: u64,
    counters: &PubSubCounters,
) -> Option<T> {
    let payload = match envelope.open(secret, get_unix_time_now(), max_skew_ms) {
        Ok(payload) => payload,
        Err(EnvelopeError::BadMac) | Err(EnvelopeError::UnknownVersion(_)) => {
            counters.mac_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Err(EnvelopeError::Stale { age_ms }) => {
            debug!("dropping stale envelope ({} ms old)", age_ms);
            counters.stale.fetch_add(1, Ordering::Relaxed);
            return None;
        }
    };
    match bincode::deserialize::<T>(payload) {
        Ok(event) => Some(event),
        Err(_) => {
            counters.undecodable.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

pub struct PubSubSink<T> {
    broker: Arc<dyn TopicBroker>,
    topic: String,
    source: String,
    secret: Vec<u8>,
    _marker: PhantomData<fn(T)>,
}

impl<T> PubSubSink<T> {
    pub fn new(
        broker: Arc<dyn TopicBroker>,
        topic: &str,
        source: &str,
        secret: Vec<u8>,
    ) -> Self {
        Self {
            broker,
            topic: topic.to_owned(),
            source: source.to_owned(),
            secret,
            _marker: PhantomData,
        }
    }
}

impl<T: WireEvent + Sync> EventSink<T> for PubSubSink<T> {
    fn publish(&self, event: T) -> Result<(), BusError> {
        let Some(envelope) = seal_event(&event, &self.source, &self.secret) else {
            return Err(BusError::Closed);
        };
        match bincode::serialize(&envelope) {
            Ok(bytes) => {
                self.broker.publish(&self.topic, bytes.into());
                Ok(())
            }
            Err(e) => {
                warn!("pubsub envelope encode failed: {}", e);
                Err(BusError::Closed)
            }
        }
    }
}

/// Subscribes a local channel to a topic. Messages published by
/// `own_source` are skipped, so a node never hears its own fan-out.
pub fn subscribe<T: WireEvent>(
    broker: &dyn TopicBroker,
    topic: &str,
    own_source: &str,
    secret: Vec<u8>,
    max_skew_ms: u64,
    forward: LocalSender<T>,
    counters: Arc<PubSubCounters>,
) {
    let own_source = own_source.to_owned();
    broker.subscribe(
        topic,
        Box::new(move |bytes| {
            let envelope: Envelope = match bincode::deserialize(&bytes) {
                Ok(envelope) => envelope,
                Err(_) => {
                    counters.undecodable.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            if envelope.source == own_source {
                return;
            }
            let Some(event) = open_event::<T>(&envelope, &secret, max_skew_ms, &counters) else {
                return;
            };
            if forward.publish(event).is_err() {
                warn!("pubsub subscriber queue refused event");
            } else {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_protocol::bus::local_channel;
    use core_protocol::id::{LeaseId, SessionId};
    use server_util::broker::MemoryBroker;

    const SECRET: &[u8] = b"topsecret";
    const SKEW: u64 = 60_000;

    fn line(n: u16) -> InboundEvent {
        InboundEvent::LineReceived {
            session_id: SessionId::compose(1_000, LeaseId::default(), n).unwrap(),
            line: "look".to_owned(),
        }
    }

    #[test]
    fn delivers_to_other_nodes_only() {
        let broker = MemoryBroker::new();
        let counters = Arc::new(PubSubCounters::default());
        let (tx, rx) = local_channel::<InboundEvent>(16);
        subscribe(
            broker.as_ref(),
            "inbound",
            "engine-1",
            SECRET.to_vec(),
            SKEW,
            tx,
            counters.clone(),
        );

        let from_self: PubSubSink<InboundEvent> =
            PubSubSink::new(broker.clone(), "inbound", "engine-1", SECRET.to_vec());
        let from_peer: PubSubSink<InboundEvent> =
            PubSubSink::new(broker.clone(), "inbound", "gateway-1", SECRET.to_vec());

        from_self.publish(line(1)).unwrap();
        from_peer.publish(line(2)).unwrap();

        let received: Vec<InboundEvent> = rx.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wrong_secret_never_reaches_subscriber() {
        let broker = MemoryBroker::new();
        let counters = Arc::new(PubSubCounters::default());
        let (tx, rx) = local_channel::<InboundEvent>(16);
        subscribe(
            broker.as_ref(),
            "inbound",
            "engine-1",
            SECRET.to_vec(),
            SKEW,
            tx,
            counters.clone(),
        );

        let forger: PubSubSink<InboundEvent> =
            PubSubSink::new(broker.clone(), "inbound", "gateway-1", b"wrong".to_vec());
        forger.publish(line(1)).unwrap();

        assert!(rx.try_iter().next().is_none());
        assert_eq!(counters.mac_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn helpers_seal_and_refuse_tampering() {
        let counters = PubSubCounters::default();
        let event = line(1);
        let envelope = seal_event(&event, "engine-1", SECRET).unwrap();
        let opened: InboundEvent = open_event(&envelope, SECRET, SKEW, &counters).unwrap();
        assert_eq!(opened.session_id(), event.session_id());

        let mut forged = envelope;
        forged.payload.push(0);
        assert!(open_event::<InboundEvent>(&forged, SECRET, SKEW, &counters).is_none());
        assert_eq!(counters.mac_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tampered_bytes_counted_not_crashed() {
        let broker = MemoryBroker::new();
        let counters = Arc::new(PubSubCounters::default());
        let (tx, rx) = local_channel::<InboundEvent>(16);
        subscribe(
            broker.as_ref(),
            "inbound",
            "engine-1",
            SECRET.to_vec(),
            SKEW,
            tx,
            counters.clone(),
        );

        broker.publish("inbound", Arc::from(&b"garbage"[..]));
        assert!(rx.try_iter().next().is_none());
        assert_eq!(counters.undecodable.load(Ordering::Relaxed), 1);
    }
}
