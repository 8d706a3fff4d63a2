//! Reconnect policy: bounded retries with escalating delay.

use super::ConnectionManager;
use crate::error::{DeviceError, Result};
use crate::identity;
use crate::state::DeviceState;
use crate::transport::LinkState;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settle time after a force-clear, on top of the configured close settle.
const FORCE_CLEAR_SETTLE: Duration = Duration::from_millis(100);

impl ConnectionManager {
    /// Re-establish the connection: up to `max_attempts` tries with an
    /// escalating delay between them.
    ///
    /// Rate limited (one call per cooldown window) and guarded against
    /// concurrent callers by the in-progress flag; a duplicate call is a
    /// logged no-op. On success the fixed hello greeting is sent. On
    /// exhaustion the device state drops to `Unknown` and the caller must
    /// explicitly retry later — there is no background retry loop.
    ///
    /// # Errors
    ///
    /// [`DeviceError::ReconnectBusy`] when another reconnect is running or
    /// the cooldown has not elapsed; [`DeviceError::ReconnectExhausted`]
    /// when every attempt failed.
    pub async fn reconnect(&self) -> Result<()> {
        let cfg = &self.config.reconnect;

        if self.ctx.reconnect.in_progress() {
            debug!("reconnect already in progress, ignoring duplicate request");
            return Err(DeviceError::ReconnectBusy);
        }
        if !self.ctx.reconnect.cooldown_elapsed(cfg.cooldown_ms) {
            debug!("reconnect too frequent, ignoring request");
            return Err(DeviceError::ReconnectBusy);
        }
        self.ctx.reconnect.mark_attempt();
        // Disconnect callbacks are ignored while this flag is set.
        self.ctx.reconnect.set_in_progress(true);

        for attempt in 1..=cfg.max_attempts {
            // A lingering non-terminal handle must be cleaned up before a
            // fresh connect, or the new connection inherits its state.
            if self.transport.link_state() != LinkState::Closed {
                info!("cleaning up lingering connection before attempt {attempt}");
                self.ctx.session.set_connected(false);
                let _ = self.transport.close("reconnect").await;
                tokio::time::sleep(Duration::from_millis(cfg.close_settle_ms)).await;
                if self.transport.link_state() != LinkState::Closed {
                    warn!("connection handle still open after close, forcing cleanup");
                    tokio::time::sleep(FORCE_CLEAR_SETTLE).await;
                    self.transport.reset().await;
                }
            }

            // Fresh session state: connected flag down, stale handshake
            // signals drained.
            self.ctx.session.reset();

            let headers = identity::device_headers(&self.ctx, &self.config.connection);
            match self.transport.connect(&self.config.connection, &headers).await {
                Ok(()) => {
                    info!("connection attempt {attempt}/{} initiated", cfg.max_attempts);
                    let wait = Duration::from_millis(cfg.handshake_timeout_ms);
                    match tokio::time::timeout(wait, self.ctx.session.handshake.acquire()).await {
                        Ok(Ok(permit)) => {
                            permit.forget();
                            if self.ctx.session.is_connected() {
                                self.ctx.reconnect.set_in_progress(false);
                                info!("reconnection successful");
                                if let Err(e) = self.send_hello().await {
                                    warn!("hello greeting send failed: {e}");
                                }
                                return Ok(());
                            }
                            warn!("handshake signalled but connection not established, retrying");
                        }
                        Ok(Err(_)) => {
                            warn!("handshake signal closed, retrying");
                        }
                        Err(_) => {
                            warn!(
                                "handshake timeout after {}ms, retrying",
                                cfg.handshake_timeout_ms
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "connection attempt {attempt}/{} failed: {e}",
                        cfg.max_attempts
                    );
                }
            }

            let delay = cfg.retry_delay_base_ms + u64::from(attempt) * cfg.retry_delay_increment_ms;
            debug!("waiting {delay}ms before next attempt");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.ctx.reconnect.set_in_progress(false);
        self.ctx.state.set(DeviceState::Unknown);
        self.peripherals.display.set_status("connect failed");
        self.peripherals.display.set_output("please retry");
        warn!("reconnect failed after all attempts");
        Err(DeviceError::ReconnectExhausted)
    }
}
