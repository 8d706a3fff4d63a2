//! Outbound wire message shapes.
//!
//! One JSON object per message. Field order matters only for readability in
//! logs, but the shapes themselves are part of the server protocol and are
//! locked down by the tests below.

use crate::error::{DeviceError, Result};
use serde::Serialize;

/// How the server should end a listening turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Server detects end of speech automatically.
    AutoStop,
    /// Client sends an explicit listen-stop.
    ManualStop,
    /// Continuous listening.
    AlwaysOn,
}

/// Fixed greeting sent once after every successful handshake.
pub const HELLO_GREETING: &str = concat!(
    r#"{"type":"hello","version":1,"transport":"websocket","#,
    r#""audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}}"#
);

#[derive(Serialize)]
struct ListenStart<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    state: &'static str,
    mode: ListeningMode,
}

#[derive(Serialize)]
struct ListenStop<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    state: &'static str,
}

#[derive(Serialize)]
struct IotUpdate<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    states: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    descriptors: Option<serde_json::Value>,
}

/// Listen-start directive.
#[must_use]
pub fn listen_start(session_id: &str, mode: ListeningMode) -> String {
    serialize(&ListenStart {
        session_id,
        kind: "listen",
        state: "start",
        mode,
    })
}

/// Listen-stop directive.
#[must_use]
pub fn listen_stop(session_id: &str) -> String {
    serialize(&ListenStop {
        session_id,
        kind: "listen",
        state: "stop",
    })
}

/// IoT state update carrying an embedded states document.
///
/// # Errors
///
/// Returns an error when `states` is not itself valid JSON.
pub fn iot_states(session_id: &str, states: &str) -> Result<String> {
    let embedded: serde_json::Value = serde_json::from_str(states)
        .map_err(|e| DeviceError::MalformedMessage(format!("iot states not JSON: {e}")))?;
    Ok(serialize(&IotUpdate {
        session_id,
        kind: "iot",
        update: true,
        states: Some(embedded),
        descriptors: None,
    }))
}

/// IoT descriptor update carrying an embedded descriptors document.
///
/// # Errors
///
/// Returns an error when `descriptors` is not itself valid JSON.
pub fn iot_descriptors(session_id: &str, descriptors: &str) -> Result<String> {
    let embedded: serde_json::Value = serde_json::from_str(descriptors)
        .map_err(|e| DeviceError::MalformedMessage(format!("iot descriptors not JSON: {e}")))?;
    Ok(serialize(&IotUpdate {
        session_id,
        kind: "iot",
        update: true,
        states: None,
        descriptors: Some(embedded),
    }))
}

fn serialize<T: Serialize>(message: &T) -> String {
    // Serialization of these fixed shapes cannot fail.
    serde_json::to_string(message).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn listen_start_shape() {
        assert_eq!(
            listen_start("sess01", ListeningMode::AutoStop),
            r#"{"session_id":"sess01","type":"listen","state":"start","mode":"auto_stop"}"#
        );
        assert_eq!(
            listen_start("sess01", ListeningMode::ManualStop),
            r#"{"session_id":"sess01","type":"listen","state":"start","mode":"manual_stop"}"#
        );
        assert_eq!(
            listen_start("sess01", ListeningMode::AlwaysOn),
            r#"{"session_id":"sess01","type":"listen","state":"start","mode":"always_on"}"#
        );
    }

    #[test]
    fn listen_stop_shape() {
        assert_eq!(
            listen_stop("sess01"),
            r#"{"session_id":"sess01","type":"listen","state":"stop"}"#
        );
    }

    #[test]
    fn iot_states_embeds_raw_document() {
        let msg = iot_states("sess01", r#"[{"name":"Screen","state":{"brightness":80}}]"#).unwrap();
        assert_eq!(
            msg,
            r#"{"session_id":"sess01","type":"iot","update":true,"states":[{"name":"Screen","state":{"brightness":80}}]}"#
        );
    }

    #[test]
    fn iot_descriptors_embeds_raw_document() {
        let msg = iot_descriptors("sess01", r#"[{"name":"Screen"}]"#).unwrap();
        assert_eq!(
            msg,
            r#"{"session_id":"sess01","type":"iot","update":true,"descriptors":[{"name":"Screen"}]}"#
        );
    }

    #[test]
    fn invalid_embedded_json_is_rejected() {
        assert!(iot_states("sess01", "not json").is_err());
    }

    #[test]
    fn greeting_is_valid_json() {
        let value: serde_json::Value = serde_json::from_str(HELLO_GREETING).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["audio_params"]["sample_rate"], 16_000);
    }
}
