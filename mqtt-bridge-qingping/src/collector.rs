//! Metric collector that stores and renders the per-device gauges.
//!
//! The collector is the registry the rest of the bridge writes into. It is
//! constructed explicitly and shared as an [`Arc`]; every operation takes its
//! own lock, so `set`/`remove` are safe to call from any task.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::mapping::{SensorMetric, build_metric_name};

/// A unique identifier for a gauge time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The gauge this series belongs to.
    pub metric: SensorMetric,
    /// Value of the `device` label.
    pub device: String,
}

impl SeriesKey {
    pub fn new(metric: SensorMetric, device: impl Into<String>) -> Self {
        Self {
            metric,
            device: device.into(),
        }
    }

    /// Format labels for Prometheus exposition format.
    pub fn format_labels(&self) -> String {
        format!("{{device=\"{}\"}}", escape_label_value(&self.device))
    }
}

/// Collector statistics.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    /// MQTT messages received on the device topic.
    pub messages_received: u64,
    /// Messages decoded into a reading and exported.
    pub readings_accepted: u64,
    /// Acknowledgements and empty messages.
    pub messages_ignored: u64,
    /// Messages that failed to decode.
    pub messages_rejected: u64,
    /// Devices whose gauges were removed for staleness.
    pub devices_reaped: u64,
}

/// Thread-safe gauge registry keyed by device identity.
pub struct MetricCollector {
    /// Metric name prefix.
    prefix: String,
    /// Current gauge values, ordered for stable rendering.
    series: RwLock<BTreeMap<SeriesKey, f64>>,
    /// Statistics.
    stats: RwLock<CollectorStats>,
}

impl MetricCollector {
    /// Create a new metric collector.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            series: RwLock::new(BTreeMap::new()),
            stats: RwLock::new(CollectorStats::default()),
        }
    }

    /// Set a gauge for a device, creating the series if needed.
    pub fn set(&self, metric: SensorMetric, device: &str, value: f64) {
        trace!(%metric, device, value, "Gauge set");
        self.series
            .write()
            .insert(SeriesKey::new(metric, device), value);
    }

    /// Remove a gauge for a device. Returns whether the series existed.
    pub fn remove(&self, metric: SensorMetric, device: &str) -> bool {
        self.series
            .write()
            .remove(&SeriesKey::new(metric, device))
            .is_some()
    }

    /// Current value of a gauge, if the series exists.
    pub fn get(&self, metric: SensorMetric, device: &str) -> Option<f64> {
        self.series
            .read()
            .get(&SeriesKey::new(metric, device))
            .copied()
    }

    /// Remove every sensor gauge of a device, keeping `LastUpdate`.
    ///
    /// Returns the number of series removed.
    pub fn remove_sensor_gauges(&self, device: &str) -> usize {
        let mut series = self.series.write();
        SensorMetric::SENSORS
            .iter()
            .filter(|metric| series.remove(&SeriesKey::new(**metric, device)).is_some())
            .count()
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Get collector statistics.
    pub fn stats(&self) -> CollectorStats {
        self.stats.read().clone()
    }

    pub fn record_received(&self) {
        self.stats.write().messages_received += 1;
    }

    pub fn record_accepted(&self) {
        self.stats.write().readings_accepted += 1;
    }

    pub fn record_ignored(&self) {
        self.stats.write().messages_ignored += 1;
    }

    pub fn record_rejected(&self) {
        self.stats.write().messages_rejected += 1;
    }

    pub fn record_reaped(&self, devices: usize) {
        self.stats.write().devices_reaped += devices as u64;
    }

    /// Render metrics in Prometheus exposition format.
    ///
    /// Gauges without any series are omitted entirely.
    pub fn render(&self) -> String {
        let series = self.series.read();
        let mut output = String::with_capacity(series.len() * 80);
        let mut current: Option<SensorMetric> = None;

        // BTreeMap order groups series by metric, then by device.
        for (key, value) in series.iter() {
            let name = build_metric_name(&self.prefix, key.metric);

            if current != Some(key.metric) {
                writeln!(output, "# HELP {} {}", name, key.metric.help()).ok();
                writeln!(output, "# TYPE {} gauge", name).ok();
                current = Some(key.metric);
            }

            writeln!(
                output,
                "{}{} {}",
                name,
                key.format_labels(),
                format_value(*value)
            )
            .ok();
        }

        output
    }
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<MetricCollector>;

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
