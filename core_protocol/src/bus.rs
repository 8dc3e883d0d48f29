// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bus interfaces shared by every deployment topology. The local variant
//! lives here because it is dependency-free; the pub/sub and streaming-RPC
//! variants live with the engine and wrap a sink of this same shape, so
//! producers cannot tell the topologies apart.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusError {
    /// Bounded queue is at capacity; the producer decides whether to retry,
    /// drop, or disconnect.
    Full,
    /// Receiver is gone.
    Closed,
}

/// A typed, bounded, non-blocking producer endpoint.
pub trait EventSink<T>: Send + Sync {
    fn publish(&self, event: T) -> Result<(), BusError>;
}

/// Producer half of the in-process bus.
pub struct LocalSender<T> {
    tx: SyncSender<T>,
}

impl<T> Clone for LocalSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> EventSink<T> for LocalSender<T> {
    fn publish(&self, event: T) -> Result<(), BusError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => BusError::Full,
            TrySendError::Disconnected(_) => BusError::Closed,
        })
    }
}

/// Bounded in-memory channel; enqueue never blocks the producer.
pub fn local_channel<T>(capacity: usize) -> (LocalSender<T>, Receiver<T>) {
    let (tx, rx) = sync_channel(capacity);
    (LocalSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use crate::bus::{local_channel, BusError, EventSink};

    #[test]
    fn full_queue_reports_without_blocking() {
        let (tx, _rx) = local_channel::<u32>(2);
        assert_eq!(tx.publish(1), Ok(()));
        assert_eq!(tx.publish(2), Ok(()));
        assert_eq!(tx.publish(3), Err(BusError::Full));
    }

    #[test]
    fn closed_receiver_reported() {
        let (tx, rx) = local_channel::<u32>(2);
        drop(rx);
        assert_eq!(tx.publish(1), Err(BusError::Closed));
    }

    #[test]
    fn fifo_for_single_producer() {
        let (tx, rx) = local_channel::<u32>(8);
        for i in 0..5 {
            tx.publish(i).unwrap();
        }
        let drained: Vec<u32> = rx.try_iter().collect();
        assert_eq!(drained, [0, 1, 2, 3, 4]);
    }
}
