//! Local input arbitration: button presses and wake-word detections.
//!
//! Producers (interrupt shims, the detector callback) only push onto an
//! unbounded channel; a single consumer task applies events strictly in FIFO
//! order. Local events are FIFO among themselves but not ordered against the
//! dispatcher or the disconnect path, so every event starts with a
//! consistency repair pass.

use crate::config::DeviceConfig;
use crate::connection::ConnectionManager;
use crate::context::AppContext;
use crate::hardware::Peripherals;
use crate::state::DeviceState;
use crate::wire::ListeningMode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a wake-word-triggered connect.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One local input event.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// Talk button pressed.
    ButtonPressed,
    /// Talk button released.
    ButtonReleased,
    /// Wake word detected.
    WakeWord {
        /// Detected phrase.
        word: String,
        /// Detector confidence, 0.0 to 1.0.
        confidence: f32,
    },
}

/// Create the input event channel. The sender side is cheap to clone and
/// safe to use from synchronous callback contexts.
#[must_use]
pub fn input_channel() -> (
    mpsc::UnboundedSender<InputEvent>,
    mpsc::UnboundedReceiver<InputEvent>,
) {
    mpsc::unbounded_channel()
}

/// Consumes local input events and drives state transitions.
pub struct InputArbiter {
    ctx: Arc<AppContext>,
    conn: Arc<ConnectionManager>,
    peripherals: Arc<Peripherals>,
    config: Arc<DeviceConfig>,
}

impl InputArbiter {
    /// Create an arbiter.
    #[must_use]
    pub fn new(
        ctx: Arc<AppContext>,
        conn: Arc<ConnectionManager>,
        peripherals: Arc<Peripherals>,
        config: Arc<DeviceConfig>,
    ) -> Self {
        Self {
            ctx,
            conn,
            peripherals,
            config,
        }
    }

    /// Spawn the single consumer task. Runs until the channel closes or
    /// `shutdown` is cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<InputEvent>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let arbiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => arbiter.handle_event(event).await,
                        None => break,
                    },
                    () = shutdown.cancelled() => break,
                }
            }
            debug!("input event consumer stopped");
        })
    }

    /// Apply one input event.
    pub async fn handle_event(&self, event: InputEvent) {
        self.repair_consistency();
        match event {
            InputEvent::ButtonPressed => self.on_button_press().await,
            InputEvent::ButtonReleased => {
                // End of speech is detected server-side in auto-stop mode.
                debug!("button released");
            }
            InputEvent::WakeWord { word, confidence } => {
                info!("wake word detected: {word} ({confidence:.2})");
                self.on_wake_word().await;
            }
        }
    }

    /// Reconcile state against the connection before acting on an event.
    /// Idempotent; does nothing when state and connection already agree.
    pub fn repair_consistency(&self) {
        let connected = self.ctx.session.is_connected();
        match self.ctx.state.get() {
            DeviceState::Listening if !connected => {
                warn!("listening while disconnected, repairing to Idle");
                self.peripherals.audio.mic_enable(false);
                self.ctx.state.set(DeviceState::Idle);
                self.peripherals.resume_wakeword();
                self.peripherals.display.set_status("ready");
            }
            DeviceState::Speaking if !connected => {
                warn!("speaking while disconnected, repairing to Unknown");
                self.peripherals.audio.speaker_enable(false);
                self.peripherals.audio.mic_enable(false);
                self.ctx.state.set(DeviceState::Unknown);
                self.peripherals.resume_wakeword();
                self.peripherals.display.set_status("sleeping");
            }
            DeviceState::Unknown if connected && !self.ctx.session.session_id().is_empty() => {
                info!("connected with live session, repairing to Idle");
                self.ctx.state.set(DeviceState::Idle);
                self.peripherals.resume_wakeword();
            }
            _ => {}
        }
    }

    async fn on_button_press(&self) {
        if !self.ctx.session.is_connected() {
            if self.ctx.reconnect.in_progress() {
                debug!("button press while reconnecting, ignored");
                self.peripherals.display.set_output("still connecting");
                return;
            }
            info!("button press while disconnected, starting reconnect");
            let conn = Arc::clone(&self.conn);
            tokio::spawn(async move {
                let _ = conn.reconnect().await;
            });
            return;
        }

        match self.ctx.state.get() {
            DeviceState::Speaking => {
                info!("button press aborts speech");
                self.peripherals.audio.speaker_enable(false);
                self.ctx.state.set(DeviceState::Idle);
            }
            DeviceState::Listening => {
                debug!("already listening, button press ignored");
            }
            DeviceState::Idle | DeviceState::Unknown => {
                self.start_listening().await;
            }
        }
    }

    async fn on_wake_word(&self) {
        match self.ctx.state.get() {
            DeviceState::Speaking => {
                // Wake word interrupts playback.
                self.peripherals.audio.speaker_enable(false);
                self.ctx.state.set(DeviceState::Idle);
            }
            DeviceState::Listening => {
                self.peripherals.audio.mic_enable(false);
                if let Err(e) = self.conn.listen_stop().await {
                    warn!("listen stop on wake word failed: {e}");
                }
            }
            DeviceState::Idle | DeviceState::Unknown => {}
        }

        if !self.ctx.session.is_connected() {
            info!("wake word while disconnected, connecting first");
            self.peripherals.display.set_status("connecting");
            let conn = Arc::clone(&self.conn);
            tokio::spawn(async move {
                let _ = conn.reconnect().await;
            });
            if !self.wait_for_connection().await {
                warn!("connection not ready in time, wake word dropped");
                self.peripherals.display.set_output("connection failed");
                return;
            }
        }

        self.start_listening().await;
    }

    /// Poll the connected flag until it rises or the configured wait runs
    /// out. Returns whether the connection came up.
    async fn wait_for_connection(&self) -> bool {
        let deadline = Duration::from_millis(self.config.reconnect.wakeword_connect_wait_ms);
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.ctx.session.is_connected() {
                return true;
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
        self.ctx.session.is_connected()
    }

    /// Claim the capture device for the microphone and open a listening
    /// turn. Rolls the hardware back if the directive cannot be sent.
    async fn start_listening(&self) {
        self.peripherals.pause_wakeword();
        self.peripherals.audio.mic_enable(true);
        match self.conn.listen_start(ListeningMode::AutoStop).await {
            Ok(()) => {
                self.peripherals.display.set_status("listening");
            }
            Err(e) => {
                warn!("cannot open listening turn: {e}");
                self.peripherals.audio.mic_enable(false);
                self.peripherals.resume_wakeword();
            }
        }
    }
}
