//! Keeps the device reporting.
//!
//! The device only publishes readings for `duration` seconds after receiving a
//! report-interval command, so the command is sent on every connect and then
//! refreshed every `2 × interval`.

use std::sync::Arc;
use std::time::Duration;

use airsight_common::DeviceTopics;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, CommandChannel};

/// Type tag of the report-interval command.
pub const COMMAND_TYPE: &str = "12";

/// Report-interval command sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveCommand {
    /// Seconds between readings.
    pub interval_secs: u64,
    /// Seconds the device keeps reporting.
    pub duration_secs: u64,
}

#[derive(Serialize)]
struct CommandPayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    up_itvl: String,
    duration: String,
}

impl KeepaliveCommand {
    pub fn new(interval_secs: u64, duration_secs: u64) -> Self {
        Self {
            interval_secs,
            duration_secs,
        }
    }

    /// Serialize to the JSON the device expects. Numbers travel as strings.
    pub fn to_payload(&self) -> Result<Vec<u8>, ChannelError> {
        let payload = CommandPayload {
            kind: COMMAND_TYPE,
            up_itvl: self.interval_secs.to_string(),
            duration: self.duration_secs.to_string(),
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Period of the refresh timer.
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.interval_secs).saturating_mul(2)
    }
}

/// Connection state as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Active,
}

/// Subscribes to the device and keeps its report-interval command fresh.
pub struct KeepaliveController<C> {
    channel: C,
    topics: DeviceTopics,
    command: KeepaliveCommand,
    state: Mutex<LinkState>,
}

impl<C: CommandChannel> KeepaliveController<C> {
    pub fn new(channel: C, topics: DeviceTopics, command: KeepaliveCommand) -> Self {
        Self {
            channel,
            topics,
            command,
            state: Mutex::new(LinkState::Disconnected),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn command(&self) -> KeepaliveCommand {
        self.command
    }

    /// Handle a (re)established session: subscribe, then send the command.
    pub async fn on_connected(&self) {
        self.mark_connected();
        self.resume().await;
    }

    /// Record the session as active.
    ///
    /// Must run in the poll loop, in event order with `on_connection_lost`.
    pub fn mark_connected(&self) {
        *self.state.lock() = LinkState::Active;
    }

    /// Subscribe to the device topic and send the command. Leaves the link
    /// state alone.
    pub async fn resume(&self) {
        let up = self.topics.up();
        match self.channel.subscribe(&up).await {
            Ok(()) => info!(topic = %up, "Subscribed to device topic"),
            Err(e) => error!(topic = %up, error = %e, "Failed to subscribe to device topic"),
        }

        if let Err(e) = self.issue_command().await {
            error!(error = %e, "Failed to send initial keepalive command");
        }
    }

    /// Handle a dropped session. Reconnecting is left to the transport.
    pub fn on_connection_lost(&self, reason: &str) {
        let previous = std::mem::replace(&mut *self.state.lock(), LinkState::Disconnected);
        if previous == LinkState::Active {
            warn!(reason, "Connection to MQTT broker lost");
        } else {
            debug!(reason, "MQTT connection attempt failed");
        }
    }

    /// Publish the report-interval command to the device's `down` topic.
    pub async fn issue_command(&self) -> Result<(), ChannelError> {
        let payload = self.command.to_payload()?;
        let down = self.topics.down();

        self.channel.publish(&down, payload).await?;

        info!(
            topic = %down,
            interval_secs = self.command.interval_secs,
            duration_secs = self.command.duration_secs,
            "Sent keepalive command"
        );
        Ok(())
    }

    /// Re-issue the command every refresh period until shutdown.
    ///
    /// Ticks while disconnected are skipped: the next connect sends a fresh
    /// command anyway.
    pub async fn run_refresh(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.command.refresh_period();
        let Some(start) = Instant::now().checked_add(period) else {
            warn!(
                period_secs = period.as_secs(),
                "Refresh period out of range, keepalive refresh disabled"
            );
            return;
        };
        let mut ticker = interval_at(start, period);

        debug!(period_secs = period.as_secs(), "Starting keepalive refresh");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.state() != LinkState::Active {
                        debug!("Skipping keepalive refresh while disconnected");
                        continue;
                    }
                    if let Err(e) = self.issue_command().await {
                        warn!(error = %e, "Failed to refresh keepalive command");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Keepalive refresh stopped");
    }
}
