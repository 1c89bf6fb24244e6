//! Message channel abstraction
//!
//! A [`MessageChannel`] is one established duplex link to a specific remote
//! session, owned by exactly one transport provider. Its lifecycle is
//! `Connecting -> Established -> Closing -> Closed`; `Closed` is terminal and
//! reached exactly once, which is what makes "notify exactly once" hold for
//! every provider built on [`ChannelStateCell`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;
use crate::identity::InstanceNodeSessionId;

static NEXT_CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a message channel
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize,
)]
#[display("{_0}")]
pub struct ChannelId(String);

impl ChannelId {
    /// Allocate a new id carrying the transport id as prefix
    pub fn generate(transport_id: &str) -> Self {
        let seq = NEXT_CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{transport_id}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Established = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Established,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Lock-free channel state with one-shot terminal transition
#[derive(Debug)]
pub struct ChannelStateCell(AtomicU8);

impl ChannelStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ChannelState::Connecting as u8))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Connecting -> Established; false if the channel already moved on
    pub fn mark_established(&self) -> bool {
        self.transition(ChannelState::Connecting, ChannelState::Established)
    }

    /// Move to Closing; false if closing or closed already
    pub fn begin_closing(&self) -> bool {
        self.transition(ChannelState::Established, ChannelState::Closing)
            || self.transition(ChannelState::Connecting, ChannelState::Closing)
    }

    /// Move to Closed; true only for the call that performed the transition
    pub fn mark_closed(&self) -> bool {
        self.0.swap(ChannelState::Closed as u8, Ordering::AcqRel) != ChannelState::Closed as u8
    }
}

impl Default for ChannelStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a channel reached the Closed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local side
    Local,
    /// The remote side said goodbye
    RemoteGoodbye,
    /// I/O error or unexpected end of stream
    Io(String),
    /// Too many consecutive unanswered health checks
    HealthCheckFailed,
    /// The remote side sent something that breaks the protocol
    ProtocolViolation(String),
    /// The owning provider shut down
    Shutdown,
}

impl CloseReason {
    /// Whether the close was requested rather than caused by a failure
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            CloseReason::Local | CloseReason::RemoteGoodbye | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::RemoteGoodbye => write!(f, "closed by remote"),
            CloseReason::Io(e) => write!(f, "I/O error: {e}"),
            CloseReason::HealthCheckFailed => write!(f, "health check failed"),
            CloseReason::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            CloseReason::Shutdown => write!(f, "transport shut down"),
        }
    }
}

/// A duplex message pipe to one remote session
///
/// `send` delivers one whole message; implementations never interleave two
/// messages on the wire.
#[async_trait]
pub trait MessageChannel: Send + Sync + fmt::Debug {
    fn channel_id(&self) -> &ChannelId;

    /// The remote session; fixed once the channel is established
    fn remote_node_id(&self) -> &InstanceNodeSessionId;

    /// Display name the remote node announced in its handshake
    fn remote_display_name(&self) -> &str;

    fn transport_id(&self) -> &str;

    fn state(&self) -> ChannelState;

    fn is_established(&self) -> bool {
        self.state() == ChannelState::Established
    }

    /// Send one message
    async fn send(&self, payload: Bytes) -> TransportResult<()>;

    /// Close the channel; returns without waiting for the peer
    async fn close(&self);
}

/// Shared handle to a channel
pub type ChannelHandle = Arc<dyn MessageChannel>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_unique() {
        let a = ChannelId::generate("direct");
        let b = ChannelId::generate("direct");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("direct-"));
    }

    #[test]
    fn test_state_lifecycle() {
        let state = ChannelStateCell::new();
        assert_eq!(state.get(), ChannelState::Connecting);
        assert!(state.mark_established());
        assert!(!state.mark_established());
        assert!(state.begin_closing());
        assert!(!state.begin_closing());
        assert_eq!(state.get(), ChannelState::Closing);
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert_eq!(state.get(), ChannelState::Closed);
        assert!(!state.mark_established());
    }

    #[test]
    fn test_closed_without_closing() {
        let state = ChannelStateCell::new();
        state.mark_established();
        assert!(state.mark_closed());
        assert!(!state.begin_closing());
    }

    #[test]
    fn test_close_reason_cleanliness() {
        assert!(CloseReason::Local.is_clean());
        assert!(CloseReason::RemoteGoodbye.is_clean());
        assert!(!CloseReason::Io("reset".into()).is_clean());
        assert!(!CloseReason::HealthCheckFailed.is_clean());
    }
}
