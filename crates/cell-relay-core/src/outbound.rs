//! Broadcast + history delivery buffer for client-bound messages.

use std::{
    collections::VecDeque,
    sync::RwLock,
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::Envelope;

/// Default history size limit (16 MB).
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

struct StoredMsg {
    envelope: Envelope,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Delivery buffer between the router and the original requester.
///
/// Transformed messages are pushed here; a client receives history first and
/// then switches to live updates, so a reconnecting consumer sees the same
/// view. Pushing never blocks on the consumer.
pub struct OutboundStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<Envelope>,
}

impl Default for OutboundStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundStore {
    /// Create a new outbound store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4096);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Push a message to live listeners and into history.
    pub fn push(&self, envelope: Envelope) {
        let _ = self.sender.send(envelope.clone());
        let bytes = envelope.approx_bytes();

        let mut inner = self.inner.write().unwrap();
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredMsg { envelope, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<Envelope> {
        self.inner
            .read()
            .unwrap()
            .history
            .iter()
            .map(|s| s.envelope.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Envelope> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, StreamName};

    fn stream_msg(text: &str) -> Envelope {
        Envelope::new(Payload::Stream {
            name: StreamName::Stdout,
            text: text.to_string(),
        })
    }

    #[test]
    fn test_history_snapshot() {
        let store = OutboundStore::new();
        store.push(stream_msg("a"));
        store.push(stream_msg("b"));

        let history = store.get_history();
        assert_eq!(history.len(), 2);
        match &history[1].payload {
            Payload::Stream { text, .. } => assert_eq!(text, "b"),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_live_delivery() {
        let store = OutboundStore::new();
        let mut rx = store.get_receiver();
        store.push(stream_msg("live"));

        let received = rx.recv().await.unwrap();
        match received.payload {
            Payload::Stream { text, .. } => assert_eq!(text, "live"),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_plus_stream_orders_history_first() {
        let store = OutboundStore::new();
        store.push(stream_msg("old"));
        let mut stream = store.history_plus_stream();
        store.push(stream_msg("new"));

        let first = stream.next().await.unwrap();
        match first.payload {
            Payload::Stream { text, .. } => assert_eq!(text, "old"),
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
