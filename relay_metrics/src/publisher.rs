//! Hand-off point between the exporter and event delivery.
//!
//! Delivery itself, with its queuing, retries and transport, lives behind
//! [`EventPublisher`]. The exporter calls `publish` once per event and never
//! looks back.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::RelayMetricsEvent;

/// Accepts finished events for asynchronous delivery.
///
/// `publish` is called from the exporter's flush task and must not block.
pub trait EventPublisher: Send + Sync {
    /// Take ownership of `event` for delivery.
    fn publish(&self, event: RelayMetricsEvent);
}

#[derive(Debug)]
/// An [`EventPublisher`] feeding an unbounded tokio channel.
///
/// The channel is unbounded so that a slow consumer never causes an already
/// built event to be dropped. Events published after the receiver is gone
/// are discarded.
pub struct ChannelPublisher {
    sender: mpsc::UnboundedSender<RelayMetricsEvent>,
    receiver_gone: AtomicBool,
}

impl ChannelPublisher {
    /// Construct a publisher and the receiver it feeds.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayMetricsEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                receiver_gone: AtomicBool::new(false),
            },
            receiver,
        )
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: RelayMetricsEvent) {
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event) {
            if self.receiver_gone.swap(true, Ordering::Relaxed) {
                debug!(relay_id = %event.relay_id, "event receiver closed, discarding event");
            } else {
                warn!(relay_id = %event.relay_id, "event receiver closed, events will be discarded");
            }
        }
    }
}
