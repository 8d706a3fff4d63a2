//! Device assembly: wires the session core together and runs it.
//!
//! The embedding layer (board support) supplies the hardware implementations
//! and the MAC-derived device id; everything else is built here. Must be
//! constructed inside a tokio runtime, since the background tasks are
//! spawned from the constructor.

use crate::arbiter::{input_channel, InputArbiter, InputEvent};
use crate::config::DeviceConfig;
use crate::connection::ConnectionManager;
use crate::context::AppContext;
use crate::dispatch::MessageDispatcher;
use crate::error::Result;
use crate::hardware::Peripherals;
use crate::provision::Provisioner;
use crate::transport::{Transport, TransportEvent, WsTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A fully wired device session core.
pub struct Device {
    ctx: Arc<AppContext>,
    conn: Arc<ConnectionManager>,
    config: Arc<DeviceConfig>,
    input_tx: mpsc::UnboundedSender<InputEvent>,
    shutdown: CancellationToken,
}

impl Device {
    /// Build a device over a real WebSocket transport.
    #[must_use]
    pub fn new(config: DeviceConfig, device_id: String, peripherals: Arc<Peripherals>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WsTransport::new(events_tx));
        Self::with_transport(config, device_id, peripherals, transport, events_rx)
    }

    /// Build a device over an arbitrary transport (tests use a fake).
    #[must_use]
    pub fn with_transport(
        config: DeviceConfig,
        device_id: String,
        peripherals: Arc<Peripherals>,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let config = Arc::new(config);
        let ctx = Arc::new(AppContext::new(device_id));
        let conn = Arc::new(ConnectionManager::new(
            Arc::clone(&ctx),
            transport,
            Arc::clone(&peripherals),
            Arc::clone(&config),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&ctx),
            Arc::clone(&conn),
            Arc::clone(&peripherals),
        ));
        conn.spawn_event_pump(dispatcher, transport_events);

        let shutdown = CancellationToken::new();
        let (input_tx, input_rx) = input_channel();
        let arbiter = Arc::new(InputArbiter::new(
            Arc::clone(&ctx),
            Arc::clone(&conn),
            peripherals,
            Arc::clone(&config),
        ));
        arbiter.spawn(input_rx, shutdown.clone());

        Self {
            ctx,
            conn,
            config,
            input_tx,
            shutdown,
        }
    }

    /// Provision (when an activation endpoint is configured) and bring the
    /// connection up.
    ///
    /// # Errors
    ///
    /// Returns the reconnect error when the connection cannot be
    /// established. Provisioning itself retries forever and never fails.
    pub async fn start(&self) -> Result<()> {
        if self.config.provision.url.is_empty() {
            info!("no activation endpoint configured, skipping provisioning");
        } else {
            let provisioner = Provisioner::new(self.config.provision.clone());
            provisioner.provision(&self.ctx).await;
        }
        self.conn.reconnect().await
    }

    /// Sender for local input events; clone freely into interrupt shims and
    /// detector callbacks.
    #[must_use]
    pub fn input_sender(&self) -> mpsc::UnboundedSender<InputEvent> {
        self.input_tx.clone()
    }

    /// Shared application context (state, session, identity).
    #[must_use]
    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Connection manager, for the audio uplink and manual directives.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    /// Stop the background input consumer. The transport pump stops when
    /// the transport is dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::hardware::{AudioHardware, WakeWordDetector};
    use crate::state::DeviceState;
    use crate::testing::{FakeAudio, FakeDisplay, FakeIot, FakeMcp, FakeTransport, FakeWakeWord};
    use std::time::Duration;

    fn device() -> (Device, Arc<FakeTransport>, Arc<FakeWakeWord>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport::new(events_tx));
        let wakeword = Arc::new(FakeWakeWord::default());
        wakeword.set_enabled(true);
        let peripherals = Arc::new(Peripherals {
            audio: Arc::new(FakeAudio::default()),
            wakeword: Arc::clone(&wakeword) as _,
            iot: Arc::new(FakeIot::default()),
            display: Arc::new(FakeDisplay::default()),
            mcp: Arc::new(FakeMcp::default()),
        });
        let mut config = DeviceConfig::default();
        config.provision.url = String::new();
        let device = Device::with_transport(
            config,
            "00:11:22:33:44:55".to_owned(),
            peripherals,
            Arc::clone(&transport) as _,
            events_rx,
        );
        (device, transport, wakeword)
    }

    #[tokio::test]
    async fn start_connects_and_greets() {
        let (device, transport, _) = device();
        transport.auto_handshake(true);

        device.start().await.unwrap();

        assert!(device.context().session.is_connected());
        assert_eq!(transport.sent_texts().len(), 1);
        assert!(transport.sent_texts()[0].contains(r#""type":"hello""#));
    }

    #[tokio::test]
    async fn input_events_flow_to_the_arbiter() {
        let (device, transport, wakeword) = device();
        transport.auto_handshake(true);
        device.start().await.unwrap();

        device.input_sender().send(InputEvent::ButtonPressed).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(device.context().state.get(), DeviceState::Listening);
        assert!(!wakeword.is_enabled());
        device.shutdown();
    }
}
