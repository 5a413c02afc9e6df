//! MQTT session driver and ingest worker.
//!
//! ```text
//! ┌──────────────┐  ConnAck   ┌──────────────────────┐
//! │  EventLoop   │───────────>│ KeepaliveController  │──> {prefix}/{mac}/down
//! │  (rumqttc)   │            └──────────────────────┘
//! │              │  Publish   ┌──────────┐   ┌──────────────────────────┐
//! │              │───────────>│ Ingestor │──>│ MetricCollector/Tracker  │
//! └──────────────┘   (mpsc)   └──────────┘   └──────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use airsight_common::config::MqttConfig;
use airsight_common::{DeviceTopics, Direction, parse_topic};
use chrono::{DateTime, Utc};
use rumqttc::{Event, EventLoop, Outgoing, Packet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::channel::MqttChannel;
use crate::collector::SharedCollector;
use crate::decoder::{Decoded, IgnoreReason, decode_at};
use crate::keepalive::KeepaliveController;
use crate::mapping::SensorMetric;
use crate::tracker::SharedTracker;

/// Capacity of the queue between the event loop and the ingest worker.
pub const INGEST_QUEUE_CAPACITY: usize = 64;

/// What happened to a message handed to the [`Ingestor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A reading was exported; `gauges` sensor gauges were set.
    Accepted { gauges: usize },
    Ignored(IgnoreReason),
    /// The payload could not be decoded.
    Rejected,
}

/// Applies decoded readings to the collector and the update tracker.
pub struct Ingestor {
    device: String,
    collector: SharedCollector,
    tracker: SharedTracker,
}

impl Ingestor {
    pub fn new(device: impl Into<String>, collector: SharedCollector, tracker: SharedTracker) -> Self {
        Self {
            device: device.into(),
            collector,
            tracker,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Handle a payload received now.
    pub fn handle(&self, payload: &[u8]) -> Outcome {
        self.handle_at(payload, Utc::now())
    }

    /// Handle a payload, stamping any reading with `received_at`.
    pub fn handle_at(&self, payload: &[u8], received_at: DateTime<Utc>) -> Outcome {
        self.collector.record_received();

        let reading = match decode_at(payload, received_at) {
            Ok(Decoded::Reading(reading)) => reading,
            Ok(Decoded::Ignored(reason)) => {
                debug!(device = %self.device, ?reason, "Ignoring message without readings");
                self.collector.record_ignored();
                return Outcome::Ignored(reason);
            }
            Err(e) => {
                warn!(device = %self.device, error = %e, "Dropping undecodable message");
                self.collector.record_rejected();
                return Outcome::Rejected;
            }
        };

        let device = self.device.as_str();
        let gauges = self.tracker.record_with(device, reading.received_at, || {
            let mut gauges = 0;
            for (metric, value) in reading.gauge_values() {
                self.collector.set(metric, device, value);
                gauges += 1;
            }
            self.collector.set(
                SensorMetric::LastUpdate,
                device,
                reading.received_at.timestamp() as f64,
            );
            gauges
        });
        self.collector.record_accepted();

        info!(
            device,
            temperature = ?reading.temperature,
            humidity = ?reading.humidity,
            co2 = ?reading.co2,
            pm25 = ?reading.pm25,
            pm10 = ?reading.pm10,
            tvoc = ?reading.tvoc,
            battery = ?reading.battery,
            "Received reading"
        );

        Outcome::Accepted { gauges }
    }

    /// Consume payloads until every sender is dropped.
    pub async fn run(self, mut queue: mpsc::Receiver<Vec<u8>>) {
        debug!(device = %self.device, "Ingest worker started");
        while let Some(payload) = queue.recv().await {
            self.handle(&payload);
        }
        debug!(device = %self.device, "Ingest worker stopped");
    }
}

/// Whether a publish on `topic` carries readings from the device behind `topics`.
pub fn is_device_uplink(topics: &DeviceTopics, topic: &str) -> bool {
    match parse_topic(topic) {
        Ok(parsed) => parsed.direction == Direction::Up && topics.owns(&parsed),
        Err(e) => {
            trace!(topic, error = %e, "Ignoring publish on unrelated topic");
            false
        }
    }
}

/// Timing settings for the session driver.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Pause after a connection error before polling again.
    pub reconnect_delay: Duration,
    /// How long to keep polling after DISCONNECT is queued.
    pub disconnect_grace: Duration,
}

impl From<&MqttConfig> for SessionTiming {
    fn from(config: &MqttConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            disconnect_grace: Duration::from_millis(config.disconnect_grace_ms),
        }
    }
}

/// Drives the rumqttc event loop for one device.
pub struct SessionDriver {
    eventloop: EventLoop,
    channel: MqttChannel,
    controller: Arc<KeepaliveController<MqttChannel>>,
    topics: DeviceTopics,
    ingest: mpsc::Sender<Vec<u8>>,
    timing: SessionTiming,
}

impl SessionDriver {
    pub fn new(
        eventloop: EventLoop,
        channel: MqttChannel,
        controller: Arc<KeepaliveController<MqttChannel>>,
        topics: DeviceTopics,
        ingest: mpsc::Sender<Vec<u8>>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            eventloop,
            channel,
            controller,
            topics,
            ingest,
            timing,
        }
    }

    /// Poll until shutdown, then disconnect cleanly.
    ///
    /// rumqttc reconnects on the next poll after an error, so errors only
    /// pause the loop for the reconnect delay.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topics.up(), "Starting MQTT session");

        loop {
            let mut backoff = false;

            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!(code = ?ack.code, "Connected to MQTT broker");
                        self.controller.mark_connected();
                        let controller = self.controller.clone();
                        tokio::spawn(async move {
                            controller.resume().await;
                        });
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch(&publish.topic, publish.payload.to_vec());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.controller.on_connection_lost(&e.to_string());
                        backoff = true;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            if backoff {
                debug!(
                    delay_secs = self.timing.reconnect_delay.as_secs(),
                    "Waiting before reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.reconnect_delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        self.disconnect().await;
    }

    fn dispatch(&self, topic: &str, payload: Vec<u8>) {
        if !is_device_uplink(&self.topics, topic) {
            return;
        }

        match self.ingest.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, "Ingest queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(topic, "Ingest worker has stopped, dropping message");
            }
        }
    }

    async fn disconnect(mut self) {
        if let Err(e) = self.channel.disconnect().await {
            debug!(error = %e, "Could not queue MQTT disconnect");
            return;
        }

        let flushed = tokio::time::timeout(self.timing.disconnect_grace, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("Disconnect not flushed within grace period");
        }
        info!("MQTT session closed");
    }
}
