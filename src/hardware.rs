//! Collaborator traits for the hardware and UI subsystems.
//!
//! The session core never touches codecs, DSP, or rendering directly — it
//! drives these narrow interfaces and the board support layer implements
//! them. Test fakes live in [`crate::testing`].

use crate::error::Result;
use std::sync::Arc;

/// Microphone, speaker, and codec control.
///
/// The microphone and the wake-word detector share the same physical capture
/// device: at most one of the two may be active at a time.
pub trait AudioHardware: Send + Sync {
    /// Enable or disable microphone capture/uplink.
    fn mic_enable(&self, enabled: bool);
    /// Whether the microphone is currently capturing.
    fn mic_is_enabled(&self) -> bool;
    /// Enable or disable speaker playback.
    fn speaker_enable(&self, enabled: bool);
    /// Whether the speaker is currently playing.
    fn speaker_is_enabled(&self) -> bool;
    /// One-time codec/encoder bring-up. `full_duplex` requests simultaneous
    /// encode and decode paths.
    fn encoder_init(&self, full_duplex: bool);
    /// Feed one downlink audio frame (opaque encoded bytes) to the decoder.
    fn downlink(&self, frame: &[u8]);
}

/// Wake-word detector control. Detections are reported through the input
/// event channel, not through this trait.
pub trait WakeWordDetector: Send + Sync {
    /// One-time model/detector initialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the detector cannot be brought up.
    fn init(&self) -> Result<()>;
    /// Tear the detector down.
    fn deinit(&self);
    /// Start detection (claims the shared capture device).
    ///
    /// # Errors
    ///
    /// Returns an error if detection cannot be started.
    fn start(&self) -> Result<()>;
    /// Stop detection (releases the shared capture device).
    ///
    /// # Errors
    ///
    /// Returns an error if detection cannot be stopped.
    fn stop(&self) -> Result<()>;
    /// Whether detection is currently running.
    fn is_enabled(&self) -> bool;
}

/// Local IoT "things" registry (lamp, screen, speaker volume, ...).
pub trait IotSubsystem: Send + Sync {
    /// One-time registry initialization.
    fn init(&self);
    /// Current states of all things as a JSON document.
    fn states_json(&self) -> Option<String>;
    /// Descriptors of all things as a JSON document.
    fn descriptors_json(&self) -> Option<String>;
    /// Invoke one command (a JSON object as bytes) against the registry.
    fn invoke(&self, command: &[u8]);
}

/// Status display. Fire-and-forget; no return values are consumed.
pub trait Display: Send + Sync {
    /// Set the short status line ("ready", "listening", ...).
    fn set_status(&self, status: &str);
    /// Set the main output/chat area text.
    fn set_output(&self, text: &str);
    /// Set the emotion/emoji tag.
    fn set_emoji(&self, emoji: &str);
}

/// External command-protocol handler for `mcp` messages.
pub trait McpHandler: Send + Sync {
    /// Parse one verbatim payload document.
    fn parse(&self, payload: &str);
}

/// Bundle of all collaborator handles, shared across components.
pub struct Peripherals {
    /// Audio capture/playback hardware.
    pub audio: Arc<dyn AudioHardware>,
    /// Wake-word detector.
    pub wakeword: Arc<dyn WakeWordDetector>,
    /// IoT things registry.
    pub iot: Arc<dyn IotSubsystem>,
    /// Status display.
    pub display: Arc<dyn Display>,
    /// MCP payload handler.
    pub mcp: Arc<dyn McpHandler>,
}

impl Peripherals {
    /// Ensure the wake-word detector is running (sleep-mode listening).
    /// No-op when it already is.
    pub fn resume_wakeword(&self) {
        if !self.wakeword.is_enabled() {
            if let Err(e) = self.wakeword.start() {
                tracing::error!("failed to restart wake word detection: {e}");
            }
        }
    }

    /// Pause the wake-word detector to free the shared capture device.
    /// No-op when it is not running.
    pub fn pause_wakeword(&self) {
        if self.wakeword.is_enabled() {
            if let Err(e) = self.wakeword.stop() {
                tracing::error!("failed to stop wake word detection: {e}");
            }
        }
    }
}
