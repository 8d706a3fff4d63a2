//! Pre-connect endpoint provisioning.
//!
//! Before the first WebSocket connect the device posts its identity to the
//! activation endpoint. Any 200 response with a body clears the gate; the
//! body itself is not interpreted further. Failures retry forever on a fixed
//! delay, since a device that cannot provision has nothing else to do.

use crate::config::ProvisionConfig;
use crate::context::AppContext;
use crate::error::{DeviceError, Result};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP provisioning client.
pub struct Provisioner {
    client: reqwest::Client,
    config: ProvisionConfig,
}

impl Provisioner {
    /// Create a provisioner for the configured endpoint.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request_body(ctx: &AppContext) -> serde_json::Value {
        json!({
            "application": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "mac_address": ctx.device_id,
            "uuid": ctx.client_id(),
        })
    }

    /// One provisioning round-trip.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Provision`] on a network failure, a non-200 status, or
    /// an empty response body.
    pub async fn provision_once(&self, ctx: &AppContext) -> Result<String> {
        let response = self
            .client
            .post(&self.config.url)
            .header("Device-Id", &ctx.device_id)
            .header("Client-Id", ctx.client_id())
            .json(&Self::request_body(ctx))
            .send()
            .await
            .map_err(|e| DeviceError::Provision(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Provision(format!(
                "activation endpoint returned {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| DeviceError::Provision(format!("cannot read response: {e}")))?;
        if body.is_empty() {
            return Err(DeviceError::Provision("empty activation response".to_owned()));
        }
        debug!("activation response: {} bytes", body.len());
        Ok(body)
    }

    /// Provision, retrying on the configured delay until it succeeds.
    pub async fn provision(&self, ctx: &AppContext) -> String {
        loop {
            match self.provision_once(ctx).await {
                Ok(body) => {
                    info!("device provisioned");
                    return body;
                }
                Err(e) => {
                    warn!("provisioning failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> ProvisionConfig {
        ProvisionConfig {
            url,
            retry_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn successful_activation_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ota/"))
            .and(header_exists("Device-Id"))
            .and(header_exists("Client-Id"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"activated":true}"#))
            .mount(&server)
            .await;

        let ctx = AppContext::new("00:11:22:33:44:55".to_owned());
        let provisioner = Provisioner::new(config(format!("{}/ota/", server.uri())));
        let body = provisioner.provision_once(&ctx).await.unwrap();
        assert_eq!(body, r#"{"activated":true}"#);
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ctx = AppContext::new("00:11:22:33:44:55".to_owned());
        let provisioner = Provisioner::new(config(server.uri()));
        let err = provisioner.provision_once(&ctx).await.unwrap_err();
        assert!(matches!(err, DeviceError::Provision(_)));
    }

    #[tokio::test]
    async fn empty_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ctx = AppContext::new("00:11:22:33:44:55".to_owned());
        let provisioner = Provisioner::new(config(server.uri()));
        assert!(provisioner.provision_once(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn provision_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let ctx = AppContext::new("00:11:22:33:44:55".to_owned());
        let provisioner = Provisioner::new(config(server.uri()));
        let body = provisioner.provision(&ctx).await;
        assert_eq!(body, "ok");
    }
}
