//! Channel events as values
//!
//! [`ChannelEventForwarder`] turns handler callbacks into a stream of
//! [`ChannelEvent`]s, for consumers that prefer a receive loop.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::{ChannelHandle, CloseReason};
use crate::transport::ChannelEventHandler;

/// A channel lifecycle event or inbound message
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Established(ChannelHandle),
    Message(ChannelHandle, Bytes),
    Closed(ChannelHandle, CloseReason),
}

impl ChannelEvent {
    pub fn channel(&self) -> &ChannelHandle {
        match self {
            ChannelEvent::Established(c)
            | ChannelEvent::Message(c, _)
            | ChannelEvent::Closed(c, _) => c,
        }
    }
}

/// Handler that forwards every callback into an unbounded queue
pub struct ChannelEventForwarder {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelEventForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ChannelEventHandler for ChannelEventForwarder {
    async fn on_channel_established(&self, channel: ChannelHandle) {
        let _ = self.tx.send(ChannelEvent::Established(channel));
    }

    async fn on_message(&self, channel: &ChannelHandle, payload: Bytes) {
        let _ = self.tx.send(ChannelEvent::Message(channel.clone(), payload));
    }

    async fn on_channel_closed(&self, channel: ChannelHandle, reason: CloseReason) {
        let _ = self.tx.send(ChannelEvent::Closed(channel, reason));
    }
}
