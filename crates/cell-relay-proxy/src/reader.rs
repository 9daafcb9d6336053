//! Channel reader tasks.
//!
//! One task per proxied engine channel. Readers never touch shared state:
//! each decoded message is forwarded as an event into the coordinator's
//! queue, so a slow channel cannot stall delivery on another.

use cell_relay_core::Envelope;
use tokio::sync::mpsc;

use crate::router::Event;

/// Spawn one reader task per engine channel.
pub(crate) fn spawn_readers(
    replies: mpsc::Receiver<Envelope>,
    broadcasts: mpsc::Receiver<Envelope>,
    inputs: mpsc::Receiver<Envelope>,
    events: &mpsc::Sender<Event>,
) {
    spawn_reader("replies", replies, events.clone(), Event::Reply);
    spawn_reader("broadcasts", broadcasts, events.clone(), Event::Broadcast);
    spawn_reader("inputs", inputs, events.clone(), Event::InputRequest);
}

fn spawn_reader(
    channel: &'static str,
    mut rx: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<Event>,
    wrap: fn(Envelope) -> Event,
) {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if events.send(wrap(envelope)).await.is_err() {
                // Coordinator is gone; nothing left to deliver to.
                return;
            }
        }
        tracing::debug!(channel, "engine channel closed");
        let _ = events.send(Event::ChannelClosed { channel }).await;
    });
}
