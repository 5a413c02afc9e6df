//! Qingping air monitor bridge: MQTT readings exported as Prometheus gauges.
//!
//! The bridge keeps a single Qingping device reporting by periodically
//! sending it a report-interval command, decodes the readings it publishes
//! and serves them on an HTTP `/metrics` endpoint. Devices that fall silent
//! have their sensor gauges removed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   MQTT broker   │────>│    Collector    │────>│   HTTP Server   │
//! │ qingping/+/up   │     │  + Tracker      │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!          ^                       │
//!          │ keepalive command     │ staleness sweep
//!          │                       v
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Keepalive     │     │     Reaper      │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! DEVICE_MAC=582D34123456 mqtt-bridge-qingping --config config.json5
//! ```
//!
//! See [`config::BridgeConfig`] for configuration options.

pub mod bridge;
pub mod channel;
pub mod collector;
pub mod config;
pub mod decoder;
pub mod http;
pub mod keepalive;
pub mod mapping;
pub mod reaper;
pub mod tracker;

pub use bridge::{Ingestor, Outcome, SessionDriver, SessionTiming};
pub use channel::{ChannelError, CommandChannel, MqttChannel};
pub use collector::{MetricCollector, SharedCollector};
pub use config::BridgeConfig;
pub use decoder::{Decoded, SensorReading, decode};
pub use http::{DeviceView, HttpServer};
pub use keepalive::{KeepaliveCommand, KeepaliveController, LinkState};
pub use reaper::StalenessReaper;
pub use tracker::{SharedTracker, UpdateTracker};
