//! Inbound message dispatcher.
//!
//! Parses one structural message at a time (one top-level `type` tag) and
//! applies it to device state, hardware, and the connection. Malformed
//! payloads are logged and discarded; an unrecognized kind is logged and
//! ignored. Neither crashes the dispatcher.

use crate::config::AudioParams;
use crate::connection::ConnectionManager;
use crate::context::AppContext;
use crate::hardware::Peripherals;
use crate::state::DeviceState;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Typed inbound control messages, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Hello {
        session_id: String,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Goodbye,
    Tts {
        #[serde(default)]
        state: String,
        #[serde(default)]
        text: Option<String>,
    },
    Llm {
        emotion: String,
    },
    Stt {
        text: String,
    },
    Iot {
        #[serde(default)]
        commands: Vec<serde_json::Value>,
    },
    Mcp {
        payload: serde_json::Value,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "hello", "goodbye", "tts", "llm", "stt", "iot", "mcp", "error",
];

/// Applies inbound server directives to state, hardware, and connection.
pub struct MessageDispatcher {
    ctx: Arc<AppContext>,
    conn: Arc<ConnectionManager>,
    peripherals: Arc<Peripherals>,
}

impl MessageDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        ctx: Arc<AppContext>,
        conn: Arc<ConnectionManager>,
        peripherals: Arc<Peripherals>,
    ) -> Self {
        Self {
            ctx,
            conn,
            peripherals,
        }
    }

    /// Handle one inbound text payload. Never panics and never returns an
    /// error: every failure mode ends at a log line.
    pub async fn handle(&self, data: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("discarding malformed message: {e}");
                return;
            }
        };
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let message: ServerMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                if KNOWN_KINDS.contains(&kind.as_str()) {
                    warn!("discarding malformed {kind} message: {e}");
                } else {
                    warn!("unknown message type: {kind}");
                }
                return;
            }
        };

        match message {
            ServerMessage::Hello {
                session_id,
                audio_params,
            } => self.on_hello(&session_id, audio_params).await,
            ServerMessage::Goodbye => self.on_goodbye(),
            ServerMessage::Tts { state, text } => self.on_tts(&state, text.as_deref()),
            ServerMessage::Llm { emotion } => {
                info!("llm emotion: {emotion}");
                self.peripherals.display.set_emoji(&emotion);
            }
            ServerMessage::Stt { text } => {
                info!("stt: {text}");
                self.peripherals.display.set_output(&text);
            }
            ServerMessage::Iot { commands } => self.on_iot(&commands).await,
            ServerMessage::Mcp { payload } => self.on_mcp(&payload),
            ServerMessage::Error { message } => match message {
                Some(message) => error!("server error: {message}"),
                None => error!("server returned error"),
            },
        }
    }

    /// Server hello: record the session, go `Idle`, and run the one-time
    /// subsystem bring-up. Repeated hellos refresh the session but the
    /// guarded initializations stay no-ops.
    async fn on_hello(&self, session_id: &str, audio_params: Option<AudioParams>) {
        let audio = audio_params.unwrap_or(self.conn.config.audio);
        self.ctx.session.set_session(session_id, audio);
        self.ctx.state.set(DeviceState::Idle);

        if !self.ctx.audio_initialized.swap(true, Ordering::SeqCst) {
            self.peripherals.audio.encoder_init(true);
            info!("audio subsystem initialized");
        }
        if !self.ctx.iot_initialized.swap(true, Ordering::SeqCst) {
            info!("initializing IoT things for first time");
            self.peripherals.iot.init();
        } else {
            debug!("IoT already initialized, skipping");
        }

        // Device descriptors and state are resent after every reconnect.
        self.conn.send_iot_descriptors().await;
        self.conn.send_iot_states().await;

        self.peripherals.display.set_status("standby");
        self.peripherals.display.set_output(" ");
        self.peripherals.display.set_emoji("neutral");

        if !self.ctx.wakeword_session_init.load(Ordering::SeqCst) {
            info!("initializing wake word detection");
            match self.peripherals.wakeword.init() {
                Ok(()) => match self.peripherals.wakeword.start() {
                    Ok(()) => {
                        self.ctx
                            .wakeword_session_init
                            .store(true, Ordering::SeqCst);
                        info!("wake word detection started");
                    }
                    Err(e) => error!("failed to start wake word detection: {e}"),
                },
                Err(e) => error!("failed to initialize wake word detection: {e}"),
            }
        } else {
            self.peripherals.resume_wakeword();
        }
    }

    /// Session ended by the server; back to sleep-mode listening.
    fn on_goodbye(&self) {
        info!("session ended");
        self.ctx.state.set(DeviceState::Unknown);
        self.peripherals.display.set_status("sleeping");
        self.peripherals.display.set_output("waiting for wake word");
        self.peripherals.display.set_emoji("sleepy");
        // Next hello re-initializes wake word for the new session.
        self.ctx
            .wakeword_session_init
            .store(false, Ordering::SeqCst);
        self.peripherals.resume_wakeword();
    }

    fn on_tts(&self, state: &str, text: Option<&str>) {
        match state {
            "start" => match self.ctx.state.get() {
                DeviceState::Idle | DeviceState::Listening => {
                    // At most one of mic and speaker may be active.
                    if self.ctx.state.get() == DeviceState::Listening {
                        self.peripherals.audio.mic_enable(false);
                    }
                    self.ctx.state.set(DeviceState::Speaking);
                    self.peripherals.display.set_status("speaking");
                    self.peripherals.audio.speaker_enable(true);
                }
                DeviceState::Speaking | DeviceState::Unknown => {
                    debug!("ignoring tts start in state {:?}", self.ctx.state.get());
                }
            },
            "stop" => {
                self.ctx.state.set(DeviceState::Idle);
                self.peripherals.audio.speaker_enable(false);
                if self.peripherals.audio.mic_is_enabled() {
                    self.peripherals.audio.mic_enable(false);
                }
                self.peripherals.display.set_status("ready");
                self.peripherals.display.set_output("ready");
                debug!("tts stopped, state reset to Idle");
                self.peripherals.resume_wakeword();
            }
            "sentence_start" => {
                let text = text.unwrap_or_default();
                info!("tts: {text}");
                self.peripherals.display.set_output(text);
            }
            "sentence_end" => {
                debug!("tts sentence ended");
            }
            other => warn!("unknown tts state: {other}"),
        }
    }

    /// Run each embedded IoT command and report the updated states after
    /// every one, so the server sees intermediate results.
    async fn on_iot(&self, commands: &[serde_json::Value]) {
        debug!("iot: {} command(s)", commands.len());
        for command in commands {
            match serde_json::to_vec(command) {
                Ok(bytes) => {
                    self.peripherals.iot.invoke(&bytes);
                    self.conn.send_iot_states().await;
                }
                Err(e) => warn!("cannot serialize iot command: {e}"),
            }
        }
    }

    /// Forward the embedded payload verbatim to the MCP parser.
    fn on_mcp(&self, payload: &serde_json::Value) {
        if !payload.is_object() {
            warn!("mcp payload is not an object, ignoring");
            return;
        }
        match serde_json::to_string(payload) {
            Ok(text) => self.peripherals.mcp.parse(&text),
            Err(e) => warn!("cannot serialize mcp payload: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::hardware::{AudioHardware, WakeWordDetector};
    use crate::testing::test_rig;

    #[tokio::test]
    async fn hello_sets_session_and_goes_idle() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);

        rig.dispatcher
            .handle(
                br#"{"type":"hello","session_id":"sess01","audio_params":{"sample_rate":16000,"frame_duration":60}}"#,
            )
            .await;

        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
        assert_eq!(rig.ctx.session.session_id(), "sess01");
        assert_eq!(rig.ctx.session.audio_params().sample_rate, 16_000);
        assert!(rig.wakeword.is_enabled());
        assert_eq!(rig.iot.init_count(), 1);
        assert_eq!(rig.audio.encoder_init_count(), 1);
        // Descriptors then states resent on every hello.
        let sent = rig.transport.sent_texts();
        assert!(sent[0].contains("\"descriptors\""));
        assert!(sent[1].contains("\"states\""));
    }

    #[tokio::test]
    async fn hello_truncates_long_session_id() {
        let rig = test_rig();
        rig.dispatcher
            .handle(br#"{"type":"hello","session_id":"abc123456789"}"#)
            .await;
        assert_eq!(rig.ctx.session.session_id(), "abc123456");
    }

    #[tokio::test]
    async fn repeated_hello_initializes_subsystems_once() {
        let rig = test_rig();
        let hello = br#"{"type":"hello","session_id":"abc123456"}"#;
        rig.dispatcher.handle(hello).await;
        rig.dispatcher.handle(hello).await;

        assert_eq!(rig.iot.init_count(), 1);
        assert_eq!(rig.audio.encoder_init_count(), 1);
        assert_eq!(rig.wakeword.init_count(), 1);
        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
    }

    #[tokio::test]
    async fn goodbye_resets_session_flags() {
        let rig = test_rig();
        rig.dispatcher
            .handle(br#"{"type":"hello","session_id":"sess01"}"#)
            .await;
        assert!(rig.ctx.wakeword_session_init.load(Ordering::SeqCst));

        rig.dispatcher.handle(br#"{"type":"goodbye"}"#).await;

        assert_eq!(rig.ctx.state.get(), DeviceState::Unknown);
        assert!(!rig.ctx.wakeword_session_init.load(Ordering::SeqCst));
        assert!(rig.wakeword.is_enabled());

        // Next hello re-runs the per-session wake word init.
        rig.dispatcher
            .handle(br#"{"type":"hello","session_id":"sess02"}"#)
            .await;
        assert_eq!(rig.wakeword.init_count(), 2);
    }

    #[tokio::test]
    async fn tts_start_stops_mic_and_starts_speaker() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Listening);
        rig.audio.mic_enable(true);

        rig.dispatcher
            .handle(br#"{"type":"tts","state":"start"}"#)
            .await;

        assert_eq!(rig.ctx.state.get(), DeviceState::Speaking);
        assert!(!rig.audio.mic_is_enabled());
        assert!(rig.audio.speaker_is_enabled());
    }

    #[tokio::test]
    async fn tts_start_ignored_when_already_speaking() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Speaking);
        rig.dispatcher
            .handle(br#"{"type":"tts","state":"start"}"#)
            .await;
        assert_eq!(rig.ctx.state.get(), DeviceState::Speaking);
        assert!(!rig.audio.speaker_is_enabled());
    }

    #[tokio::test]
    async fn tts_stop_returns_to_idle_and_resumes_wakeword() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Speaking);
        rig.audio.speaker_enable(true);
        rig.wakeword.set_enabled(false);

        rig.dispatcher
            .handle(br#"{"type":"tts","state":"stop"}"#)
            .await;

        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
        assert!(!rig.audio.speaker_is_enabled());
        assert!(!rig.audio.mic_is_enabled());
        assert!(rig.wakeword.is_enabled());
    }

    #[tokio::test]
    async fn tts_sentence_start_forwards_text() {
        let rig = test_rig();
        rig.dispatcher
            .handle(br#"{"type":"tts","state":"sentence_start","text":"hi there"}"#)
            .await;
        assert_eq!(rig.display.last_output().as_deref(), Some("hi there"));
        assert_eq!(rig.ctx.state.get(), DeviceState::Unknown);
    }

    #[tokio::test]
    async fn llm_emotion_reaches_display() {
        let rig = test_rig();
        rig.dispatcher
            .handle(br#"{"type":"llm","emotion":"happy"}"#)
            .await;
        assert_eq!(rig.display.last_emoji().as_deref(), Some("happy"));
    }

    #[tokio::test]
    async fn iot_commands_invoke_and_report() {
        let rig = test_rig();
        rig.ctx.session.set_connected(true);
        rig.dispatcher
            .handle(
                br#"{"type":"iot","commands":[{"name":"Screen","method":"SetBrightness"},{"name":"Screen","method":"SetEmoji"}]}"#,
            )
            .await;
        assert_eq!(rig.iot.invoked().len(), 2);
        // One states report per command.
        let states_reports = rig
            .transport
            .sent_texts()
            .iter()
            .filter(|m| m.contains("\"states\""))
            .count();
        assert_eq!(states_reports, 2);
    }

    #[tokio::test]
    async fn mcp_payload_forwarded_verbatim() {
        let rig = test_rig();
        rig.dispatcher
            .handle(br#"{"type":"mcp","payload":{"jsonrpc":"2.0","method":"ping"}}"#)
            .await;
        let payloads = rig.mcp.payloads();
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(value["method"], "ping");
    }

    #[tokio::test]
    async fn malformed_payload_is_discarded() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Idle);
        rig.dispatcher.handle(b"\x00\x01 not json").await;
        rig.dispatcher.handle(b"{\"type\":").await;
        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored() {
        let rig = test_rig();
        rig.ctx.state.set(DeviceState::Idle);
        rig.dispatcher
            .handle(br#"{"type":"telemetry","level":3}"#)
            .await;
        assert_eq!(rig.ctx.state.get(), DeviceState::Idle);
    }

    #[tokio::test]
    async fn hello_missing_session_id_is_malformed() {
        let rig = test_rig();
        rig.dispatcher.handle(br#"{"type":"hello"}"#).await;
        assert_eq!(rig.ctx.state.get(), DeviceState::Unknown);
        assert_eq!(rig.ctx.session.session_id(), "");
    }
}
