//! Device and client identity helpers.

use crate::config::ConnectionConfig;
use crate::context::AppContext;

/// Generate a fresh client identifier (UUID v4 text form).
///
/// Called once per process via [`AppContext::client_id`]; the value is
/// cached for the process lifetime.
#[must_use]
pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Format a 6-byte hardware MAC address as `aa:bb:cc:dd:ee:ff`.
#[must_use]
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Headers identifying this device on every connect and provisioning call.
#[must_use]
pub fn device_headers(ctx: &AppContext, config: &ConnectionConfig) -> Vec<(String, String)> {
    vec![
        (
            "Protocol-Version".to_owned(),
            config.protocol_version.to_string(),
        ),
        ("Device-Id".to_owned(), ctx.device_id.clone()),
        ("Client-Id".to_owned(), ctx.client_id().to_owned()),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn mac_formatting() {
        let mac = [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0xfe];
        assert_eq!(format_mac(&mac), "00:1a:2b:3c:4d:fe");
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(new_client_id(), new_client_id());
    }

    #[test]
    fn headers_carry_identity() {
        let ctx = AppContext::new("aa:bb:cc:dd:ee:ff".to_owned());
        let config = ConnectionConfig::default();
        let headers = device_headers(&ctx, &config);
        assert_eq!(headers[0].0, "Protocol-Version");
        assert_eq!(headers[0].1, "1");
        assert_eq!(headers[1], ("Device-Id".to_owned(), "aa:bb:cc:dd:ee:ff".to_owned()));
        assert_eq!(headers[2].0, "Client-Id");
    }
}
