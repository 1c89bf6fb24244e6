//! Direct channels and the channel registry
//!
//! A [`DirectChannel`] wraps one TCP socket. Writes go through a single
//! writer lock so frames never interleave; the read side is driven by the
//! provider's reader task, which is also the only place that reports the
//! channel as closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::debug;

use overlink_core::{
    ChannelId, ChannelState, ChannelStateCell, CloseReason, HandshakeInfo,
    InstanceNodeSessionId, MessageChannel, TransportError, TransportResult,
};

use crate::protocol::{MAX_FRAME_SIZE, WireFrame, write_frame};

/// Transport id of the direct TCP transport
pub const DIRECT_TRANSPORT_ID: &str = "direct";

/// Configuration for the direct transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectTransportConfig {
    /// Maximum number of concurrent channels
    pub max_channels: usize,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Interval between health check pings in milliseconds
    pub health_check_interval_ms: u64,
    /// Consecutive unanswered pings before the channel is considered broken
    pub max_health_check_failures: u32,
    /// Maximum encoded frame size in bytes
    pub max_frame_size: usize,
}

impl Default for DirectTransportConfig {
    fn default() -> Self {
        Self {
            max_channels: 256,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            health_check_interval_ms: 20_000,
            max_health_check_failures: 3,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl DirectTransportConfig {
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_health_check(mut self, interval: Duration, max_failures: u32) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self.max_health_check_failures = max_failures;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// One TCP-backed message channel
pub struct DirectChannel {
    id: ChannelId,
    remote: HandshakeInfo,
    state: ChannelStateCell,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    max_frame_size: usize,
    /// Pings sent since the last frame received
    unanswered_pings: AtomicU32,
    close_reason: Mutex<Option<CloseReason>>,
    close_signal: Notify,
}

impl DirectChannel {
    pub(crate) fn new(remote: HandshakeInfo, writer: OwnedWriteHalf, max_frame_size: usize) -> Self {
        Self {
            id: ChannelId::generate(DIRECT_TRANSPORT_ID),
            remote,
            state: ChannelStateCell::new(),
            writer: tokio::sync::Mutex::new(writer),
            max_frame_size,
            unanswered_pings: AtomicU32::new(0),
            close_reason: Mutex::new(None),
            close_signal: Notify::new(),
        }
    }

    pub(crate) fn mark_established(&self) -> bool {
        self.state.mark_established()
    }

    pub(crate) fn mark_closed(&self) -> bool {
        self.state.mark_closed()
    }

    pub(crate) fn close_signal(&self) -> &Notify {
        &self.close_signal
    }

    /// Reason recorded by whoever initiated the close
    pub(crate) fn take_close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().take()
    }

    pub(crate) fn record_activity(&self) {
        self.unanswered_pings.store(0, Ordering::Release);
    }

    /// Count a ping about to be sent; returns the new number of unanswered pings
    pub(crate) fn count_ping(&self) -> u32 {
        self.unanswered_pings.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) async fn write(&self, frame: &WireFrame) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame, self.max_frame_size)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Start closing with the given reason; no-op if already closing
    pub(crate) async fn initiate_close(&self, reason: CloseReason, say_goodbye: bool) {
        if !self.state.begin_closing() {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        if say_goodbye {
            let _ = self.write(&WireFrame::Goodbye).await;
        }
        let _ = self.writer.lock().await.shutdown().await;
        self.close_signal.notify_one();
    }
}

impl std::fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectChannel")
            .field("id", &self.id)
            .field("remote", &self.remote.node_id)
            .field("state", &self.state.get())
            .finish()
    }
}

#[async_trait]
impl MessageChannel for DirectChannel {
    fn channel_id(&self) -> &ChannelId {
        &self.id
    }

    fn remote_node_id(&self) -> &InstanceNodeSessionId {
        &self.remote.node_id
    }

    fn remote_display_name(&self) -> &str {
        &self.remote.display_name
    }

    fn transport_id(&self) -> &str {
        DIRECT_TRANSPORT_ID
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn send(&self, payload: Bytes) -> TransportResult<()> {
        if self.state.get() != ChannelState::Established {
            return Err(TransportError::ChannelClosed(self.id.to_string()));
        }
        if let Err(e) = self.write(&WireFrame::Data(payload)).await {
            debug!(channel = %self.id, error = %e, "Send failed, closing channel");
            self.initiate_close(CloseReason::Io(e.to_string()), false).await;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) {
        self.initiate_close(CloseReason::Local, true).await;
    }
}

/// Live channels of one provider
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<DirectChannel>>,
    max_channels: usize,
}

impl ChannelRegistry {
    pub fn new(max_channels: usize) -> Self {
        Self {
            channels: DashMap::new(),
            max_channels,
        }
    }

    /// Whether another channel fits under the limit
    pub fn has_capacity(&self) -> bool {
        self.channels.len() < self.max_channels
    }

    pub(crate) fn insert(&self, channel: Arc<DirectChannel>) {
        self.channels.insert(channel.id.clone(), channel);
    }

    pub(crate) fn remove(&self, id: &ChannelId) -> Option<Arc<DirectChannel>> {
        self.channels.remove(id).map(|(_, ch)| ch)
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<DirectChannel>> {
        self.channels.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Established channels to one remote session
    pub fn channels_to(&self, remote: &InstanceNodeSessionId) -> Vec<Arc<DirectChannel>> {
        self.channels
            .iter()
            .filter(|c| c.value().remote_node_id() == remote && c.value().is_established())
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<DirectChannel>> {
        let all: Vec<_> = self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        self.channels.clear();
        all
    }

    /// Drop entries whose channel already reached Closed
    pub fn cleanup_stale(&self) {
        let stale: Vec<_> = self
            .channels
            .iter()
            .filter(|c| c.value().state() == ChannelState::Closed)
            .map(|c| c.key().clone())
            .collect();

        for id in stale {
            self.channels.remove(&id);
            debug!(channel = %id, "Removed stale channel");
        }
    }

    pub fn stats(&self) -> ChannelStats {
        let active = self
            .channels
            .iter()
            .filter(|c| c.value().is_established())
            .count();

        ChannelStats {
            active_channels: active,
            total_channels: self.channels.len(),
            max_channels: self.max_channels,
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Number of established channels
    pub active_channels: usize,
    /// Total channels in the registry (including closing ones)
    pub total_channels: usize,
    /// Maximum allowed channels
    pub max_channels: usize,
}
