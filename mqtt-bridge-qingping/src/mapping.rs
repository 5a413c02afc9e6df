//! Mapping from Qingping sensor fields to Prometheus metric names.

/// Default metric name prefix.
pub const DEFAULT_PREFIX: &str = "qingping";

/// A gauge exported per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorMetric {
    Temperature,
    Humidity,
    Co2,
    Pm25,
    Pm10,
    Tvoc,
    Battery,
    LastUpdate,
}

impl SensorMetric {
    /// Every exported gauge, in exposition order.
    pub const ALL: [SensorMetric; 8] = [
        SensorMetric::Temperature,
        SensorMetric::Humidity,
        SensorMetric::Co2,
        SensorMetric::Pm25,
        SensorMetric::Pm10,
        SensorMetric::Tvoc,
        SensorMetric::Battery,
        SensorMetric::LastUpdate,
    ];

    /// Gauges carrying sensor values. These are the ones removed when a
    /// device goes stale; `LastUpdate` is left behind.
    pub const SENSORS: [SensorMetric; 7] = [
        SensorMetric::Temperature,
        SensorMetric::Humidity,
        SensorMetric::Co2,
        SensorMetric::Pm25,
        SensorMetric::Pm10,
        SensorMetric::Tvoc,
        SensorMetric::Battery,
    ];

    /// Key of this field inside a `sensorData` entry.
    pub fn field_name(&self) -> &'static str {
        match self {
            SensorMetric::Temperature => "temperature",
            SensorMetric::Humidity => "humidity",
            SensorMetric::Co2 => "co2",
            SensorMetric::Pm25 => "pm25",
            SensorMetric::Pm10 => "pm10",
            SensorMetric::Tvoc => "tvoc",
            SensorMetric::Battery => "battery",
            SensorMetric::LastUpdate => "timestamp",
        }
    }

    /// Metric name without prefix.
    pub fn suffix(&self) -> &'static str {
        match self {
            SensorMetric::Temperature => "temperature_celsius",
            SensorMetric::Humidity => "humidity_percent",
            SensorMetric::Co2 => "co2_ppm",
            SensorMetric::Pm25 => "pm25_ugm3",
            SensorMetric::Pm10 => "pm10_ugm3",
            SensorMetric::Tvoc => "tvoc_ppb",
            SensorMetric::Battery => "battery_percent",
            SensorMetric::LastUpdate => "last_update_timestamp",
        }
    }

    /// HELP text for the exposition format.
    pub fn help(&self) -> &'static str {
        match self {
            SensorMetric::Temperature => "Temperature in Celsius",
            SensorMetric::Humidity => "Humidity percentage",
            SensorMetric::Co2 => "CO2 level in parts per million",
            SensorMetric::Pm25 => "PM2.5 in micrograms per cubic meter",
            SensorMetric::Pm10 => "PM10 in micrograms per cubic meter",
            SensorMetric::Tvoc => "TVOC in parts per billion",
            SensorMetric::Battery => "Battery percentage",
            SensorMetric::LastUpdate => "Timestamp of last sensor update",
        }
    }

    /// Whether the device value is an integer quantity (truncated on decode).
    pub fn is_integral(&self) -> bool {
        matches!(self, SensorMetric::Co2 | SensorMetric::Battery)
    }
}

impl std::fmt::Display for SensorMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Sanitize a metric name prefix to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// Invalid characters become underscores, runs of underscores collapse and
/// a leading digit gets an underscore in front.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
        last_was_underscore = true;
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == ':' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    result
}

/// Build a full Prometheus metric name.
///
/// Format: `{prefix}_{suffix}`, or just the suffix when the prefix is empty.
pub fn build_metric_name(prefix: &str, metric: SensorMetric) -> String {
    let prefix = sanitize_metric_name(prefix);

    if prefix.is_empty() {
        metric.suffix().to_string()
    } else {
        format!("{}_{}", prefix, metric.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_metric_name() {
        assert_eq!(
            build_metric_name("qingping", SensorMetric::Temperature),
            "qingping_temperature_celsius"
        );
        assert_eq!(
            build_metric_name("qingping", SensorMetric::LastUpdate),
            "qingping_last_update_timestamp"
        );
        assert_eq!(build_metric_name("", SensorMetric::Co2), "co2_ppm");
    }

    #[test]
    fn test_build_metric_name_sanitizes_prefix() {
        assert_eq!(
            build_metric_name("air-monitor", SensorMetric::Pm25),
            "air_monitor_pm25_ugm3"
        );
        assert_eq!(build_metric_name("///", SensorMetric::Tvoc), "tvoc_ppb");
    }

    #[test]
    fn test_sanitize_metric_name() {
        assert_eq!(sanitize_metric_name("qingping"), "qingping");
        assert_eq!(sanitize_metric_name("home.air"), "home_air");
        assert_eq!(sanitize_metric_name("a__b"), "a_b");
        assert_eq!(sanitize_metric_name("1st"), "_1st");
        assert_eq!(sanitize_metric_name("ns:sub"), "ns:sub");
    }

    #[test]
    fn test_sensor_metrics_exclude_last_update() {
        assert_eq!(SensorMetric::SENSORS.len(), 7);
        assert!(!SensorMetric::SENSORS.contains(&SensorMetric::LastUpdate));
        assert!(SensorMetric::ALL.contains(&SensorMetric::LastUpdate));
    }

    #[test]
    fn test_integral_metrics() {
        assert!(SensorMetric::Co2.is_integral());
        assert!(SensorMetric::Battery.is_integral());
        assert!(!SensorMetric::Temperature.is_integral());
        assert!(!SensorMetric::Tvoc.is_integral());
    }
}
