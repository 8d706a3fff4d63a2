//! Connection manager: owns the streaming connection and serializes writes.
//!
//! All writers (audio uplink, control messages) share one write lock.
//! Control senders attempt the lock without blocking and drop the send when
//! busy; only the disconnect teardown blocks on it, so tearing down waits
//! for any in-flight write instead of racing it.

mod reconnect;

use crate::context::AppContext;
use crate::dispatch::MessageDispatcher;
use crate::error::{DeviceError, Result};
use crate::hardware::Peripherals;
use crate::state::DeviceState;
use crate::transport::{FrameKind, Transport, TransportEvent};
use crate::wire::{self, ListeningMode};
use crate::config::DeviceConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Owns the transport handle and the write path; reacts to transport events.
pub struct ConnectionManager {
    pub(crate) ctx: Arc<AppContext>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) peripherals: Arc<Peripherals>,
    pub(crate) config: Arc<DeviceConfig>,
}

impl ConnectionManager {
    /// Create a manager over an already-constructed transport.
    #[must_use]
    pub fn new(
        ctx: Arc<AppContext>,
        transport: Arc<dyn Transport>,
        peripherals: Arc<Peripherals>,
        config: Arc<DeviceConfig>,
    ) -> Self {
        Self {
            ctx,
            transport,
            peripherals,
            config,
        }
    }

    /// Write one frame through the serialized write path.
    ///
    /// Fails fast instead of blocking: callers on the audio path drop the
    /// frame, control paths log. The connected flag is checked before and
    /// after lock acquisition to guard against a disconnect racing the wait.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotConnected`] when no connection is established,
    /// [`DeviceError::LockBusy`] when another write is in flight, or the
    /// transport error for the failed write. A peer close/reset flips the
    /// connected flag so later writers fail fast.
    pub async fn write(&self, payload: &[u8], kind: FrameKind) -> Result<()> {
        if !self.ctx.session.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let guard = self
            .ctx
            .session
            .write_lock
            .try_lock()
            .map_err(|_| DeviceError::LockBusy)?;
        if !self.ctx.session.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let result = self.transport.write(payload, kind).await;
        drop(guard);
        match result {
            Ok(()) => Ok(()),
            Err(DeviceError::TransportClosed) => {
                // Peer closed or reset: mark disconnected so subsequent
                // writers do not retry doomed writes.
                self.ctx.session.set_connected(false);
                Err(DeviceError::TransportClosed)
            }
            Err(e) => Err(e),
        }
    }

    /// Send one control message, logging failures.
    ///
    /// # Errors
    ///
    /// Propagates the underlying write error after logging it.
    pub async fn send_text(&self, message: &str) -> Result<()> {
        match self.write(message.as_bytes(), FrameKind::Text).await {
            Ok(()) => Ok(()),
            Err(DeviceError::LockBusy) => {
                debug!("write path busy, control message dropped");
                Err(DeviceError::LockBusy)
            }
            Err(e) => {
                warn!("control message send failed: {e}");
                Err(e)
            }
        }
    }

    /// Send one encoded audio frame, best effort. A busy write path or a
    /// dead connection silently drops the frame.
    pub async fn send_audio(&self, frame: &[u8]) {
        match self.write(frame, FrameKind::Binary).await {
            Ok(()) => {}
            Err(DeviceError::LockBusy) => {
                debug!("write path busy, audio frame skipped");
            }
            Err(DeviceError::NotConnected) => {}
            Err(e) => debug!("audio frame send failed: {e}"),
        }
    }

    /// Send the fixed hello greeting.
    ///
    /// # Errors
    ///
    /// Propagates the underlying write error.
    pub async fn send_hello(&self) -> Result<()> {
        self.send_text(wire::HELLO_GREETING).await
    }

    /// Send a listen-start directive. State becomes `Listening` only after
    /// the send succeeds, keeping state and server view in sync. A no-op
    /// (beyond the log) when disconnected.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotConnected`] when disconnected, otherwise the write
    /// error.
    pub async fn listen_start(&self, mode: ListeningMode) -> Result<()> {
        if !self.ctx.session.is_connected() {
            warn!("not connected, cannot send listen start");
            return Err(DeviceError::NotConnected);
        }
        let message = wire::listen_start(&self.ctx.session.session_id(), mode);
        self.send_text(&message).await?;
        self.ctx.state.set(DeviceState::Listening);
        debug!("state updated to Listening after successful send");
        Ok(())
    }

    /// Send a listen-stop directive and return to `Idle`, resuming wake-word
    /// detection. When disconnected the directive is skipped but the state
    /// is still forced to `Idle` so a dead session cannot stay `Listening`.
    ///
    /// # Errors
    ///
    /// Propagates the write error when connected and the send fails.
    pub async fn listen_stop(&self) -> Result<()> {
        if !self.ctx.session.is_connected() {
            debug!("not connected, forcing Idle without listen stop");
            self.ctx.state.set(DeviceState::Idle);
            return Ok(());
        }
        let message = wire::listen_stop(&self.ctx.session.session_id());
        self.send_text(&message).await?;
        self.ctx.state.set(DeviceState::Idle);
        self.peripherals.resume_wakeword();
        Ok(())
    }

    /// Report current IoT states to the server.
    pub async fn send_iot_states(&self) {
        let Some(states) = self.peripherals.iot.states_json() else {
            error!("failed to get IoT states");
            return;
        };
        match wire::iot_states(&self.ctx.session.session_id(), &states) {
            Ok(message) => {
                let _ = self.send_text(&message).await;
            }
            Err(e) => error!("cannot build IoT state update: {e}"),
        }
    }

    /// Report IoT thing descriptors to the server.
    pub async fn send_iot_descriptors(&self) {
        let Some(descriptors) = self.peripherals.iot.descriptors_json() else {
            error!("failed to get IoT descriptors");
            return;
        };
        match wire::iot_descriptors(&self.ctx.session.session_id(), &descriptors) {
            Ok(message) => {
                let _ = self.send_text(&message).await;
            }
            Err(e) => error!("cannot build IoT descriptor update: {e}"),
        }
    }

    /// Handle one transport event. Text and binary frames are forwarded to
    /// the dispatcher and the audio decoder respectively.
    pub async fn handle_event(&self, event: TransportEvent, dispatcher: &MessageDispatcher) {
        match event {
            TransportEvent::Connected { status } => {
                if status == 101 {
                    info!("websocket connected");
                    self.ctx.session.set_connected(true);
                    self.ctx.session.signal_handshake();
                } else {
                    warn!("unexpected upgrade status {status}, ignoring");
                }
            }
            TransportEvent::Disconnected => self.handle_disconnect().await,
            TransportEvent::Text(text) => dispatcher.handle(text.as_bytes()).await,
            TransportEvent::Binary(frame) => self.peripherals.audio.downlink(&frame),
        }
    }

    /// Disconnect teardown. Blocks on the write lock so any in-flight write
    /// finishes before the session state is torn down.
    async fn handle_disconnect(&self) {
        let guard = self.ctx.session.write_lock.lock().await;

        // A reconnect in progress churns the transport on purpose; reacting
        // to its disconnects would corrupt the fresh session state.
        if self.ctx.reconnect.in_progress() {
            debug!("ignoring disconnect during reconnect");
            return;
        }
        if !self.ctx.session.is_connected() {
            debug!("ignoring disconnect when already disconnected");
            return;
        }

        match self.ctx.state.get() {
            DeviceState::Listening => {
                self.peripherals.audio.mic_enable(false);
                debug!("stopped microphone due to disconnection");
            }
            DeviceState::Speaking => {
                self.peripherals.audio.speaker_enable(false);
                debug!("stopped speaker due to disconnection");
            }
            DeviceState::Idle | DeviceState::Unknown => {}
        }

        info!("websocket closed");
        self.peripherals.display.set_status("sleeping");
        self.peripherals.display.set_output("waiting for wake word");
        self.peripherals.display.set_emoji("sleepy");
        self.ctx.session.set_connected(false);
        self.ctx.state.set(DeviceState::Unknown);
        self.peripherals.resume_wakeword();

        drop(guard);

        // Allow an immediate reconnect after an observed disconnect.
        self.ctx.reconnect.clear_cooldown();
    }

    /// Spawn the transport event pump: a single task consuming the
    /// registered event channel for the lifetime of the process.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        dispatcher: Arc<MessageDispatcher>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_event(event, &dispatcher).await;
            }
            debug!("transport event channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::hardware::{AudioHardware, WakeWordDetector};
    use crate::testing::{test_rig, TestRig};
    use crate::transport::LinkState;

    #[tokio::test]
    async fn write_fails_fast_when_disconnected() {
        let TestRig { conn, .. } = test_rig();
        let err = conn.write(b"x", FrameKind::Text).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
    }

    #[tokio::test]
    async fn write_reports_lock_busy() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);
        let _held = rig.ctx.session.write_lock.lock().await;
        let err = rig.conn.write(b"x", FrameKind::Text).await.unwrap_err();
        assert!(matches!(err, DeviceError::LockBusy));
    }

    #[tokio::test]
    async fn peer_close_flips_connected_flag() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);
        rig.transport.fail_writes_with_close();
        let err = rig.conn.write(b"x", FrameKind::Text).await.unwrap_err();
        assert!(matches!(err, DeviceError::TransportClosed));
        assert!(!rig.ctx.session.is_connected());
    }

    #[tokio::test]
    async fn listen_start_noop_when_disconnected() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Idle);
        let err = rig.conn.listen_start(ListeningMode::AutoStop).await;
        assert!(matches!(err, Err(DeviceError::NotConnected)));
        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
        assert!(rig.transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn listen_start_transitions_after_send() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);
        rig.ctx.session.set_session("sess01", Default::default());
        rig.ctx.state.set(DeviceState::Idle);
        rig.conn.listen_start(ListeningMode::AutoStop).await.unwrap();
        assert_eq!(rig.ctx.state.get(), DeviceState::Listening);
        assert_eq!(
            rig.transport.sent_texts(),
            vec![r#"{"session_id":"sess01","type":"listen","state":"start","mode":"auto_stop"}"#]
        );
    }

    #[tokio::test]
    async fn listen_stop_forces_idle_when_disconnected() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Listening);
        rig.conn.listen_stop().await.unwrap();
        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
        assert!(rig.transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn disconnect_event_during_listening_stops_mic() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);
        rig.ctx.state.set(DeviceState::Listening);
        rig.audio.mic_enable(true);
        rig.wakeword.set_enabled(false);

        rig.conn
            .handle_event(TransportEvent::Disconnected, &rig.dispatcher)
            .await;

        assert!(!rig.audio.mic_is_enabled());
        assert_eq!(rig.ctx.state.get(), DeviceState::Unknown);
        assert!(!rig.ctx.session.is_connected());
        assert!(rig.wakeword.is_enabled());
        // Cooldown cleared so the next reconnect may run immediately.
        assert!(rig.ctx.reconnect.cooldown_elapsed(5_000));
    }

    #[tokio::test]
    async fn disconnect_event_ignored_during_reconnect() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);
        rig.ctx.state.set(DeviceState::Listening);
        rig.audio.mic_enable(true);
        rig.ctx.reconnect.set_in_progress(true);

        rig.conn
            .handle_event(TransportEvent::Disconnected, &rig.dispatcher)
            .await;

        // Nothing torn down: the reconnect owns the transport right now.
        assert!(rig.ctx.session.is_connected());
        assert_eq!(rig.ctx.state.get(), DeviceState::Listening);
        assert!(rig.audio.mic_is_enabled());
    }

    #[tokio::test]
    async fn disconnect_event_idempotent_when_already_down() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Idle);
        rig.conn
            .handle_event(TransportEvent::Disconnected, &rig.dispatcher)
            .await;
        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
    }

    #[tokio::test]
    async fn connected_event_releases_handshake_once() {
        let rig = test_rig();
        rig.conn
            .handle_event(TransportEvent::Connected { status: 101 }, &rig.dispatcher)
            .await;
        assert!(rig.ctx.session.is_connected());
        let permit = rig.ctx.session.handshake.try_acquire().unwrap();
        permit.forget();
        assert!(rig.ctx.session.handshake.try_acquire().is_err());
    }

    #[tokio::test]
    async fn non_upgrade_status_is_ignored() {
        let rig = test_rig();
        rig.conn
            .handle_event(TransportEvent::Connected { status: 403 }, &rig.dispatcher)
            .await;
        assert!(!rig.ctx.session.is_connected());
        assert!(rig.ctx.session.handshake.try_acquire().is_err());
    }

    #[tokio::test]
    async fn binary_event_feeds_audio_downlink() {
        let rig = test_rig();
        rig.conn
            .handle_event(TransportEvent::Binary(vec![1, 2, 3]), &rig.dispatcher)
            .await;
        assert_eq!(rig.audio.downlinked(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn fake_transport_starts_closed() {
        let rig = test_rig();
        assert_eq!(rig.transport.link_state(), LinkState::Closed);
    }
}
