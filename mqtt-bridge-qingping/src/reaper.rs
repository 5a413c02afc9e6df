//! Periodic removal of gauges for devices that stopped reporting.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::collector::SharedCollector;
use crate::tracker::SharedTracker;

/// A device removed by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedDevice {
    pub device: String,
    pub silence: Duration,
}

/// Expires the sensor gauges of devices silent for `2 × interval`.
pub struct StalenessReaper {
    tracker: SharedTracker,
    collector: SharedCollector,
    interval: Duration,
}

impl StalenessReaper {
    /// Create a reaper ticking every `interval`.
    pub fn new(tracker: SharedTracker, collector: SharedCollector, interval: Duration) -> Self {
        Self {
            tracker,
            collector,
            interval,
        }
    }

    /// Silence after which a device is considered stale.
    pub fn cutoff(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    /// Remove every stale device as of `now`.
    ///
    /// The sensor gauges go, the last-update gauge stays as a marker of when
    /// the device was last heard from.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ReapedDevice> {
        let mut reaped = Vec::new();

        self.tracker.sweep(now, self.cutoff(), |device, silence| {
            let removed = self.collector.remove_sensor_gauges(device);
            info!(
                device,
                silence_secs = silence.as_secs(),
                gauges_removed = removed,
                "Device has not responded, removing stale metrics"
            );
            reaped.push(ReapedDevice {
                device: device.to_string(),
                silence,
            });
        });

        if !reaped.is_empty() {
            self.collector.record_reaped(reaped.len());
        }

        reaped
    }

    /// Sweep every `interval` until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);

        info!(
            interval_secs = self.interval.as_secs(),
            cutoff_secs = self.cutoff().as_secs(),
            "Starting staleness reaper"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.sweep(Utc::now());
                    debug!(
                        reaped = reaped.len(),
                        tracked = self.tracker.len(),
                        "Staleness sweep complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Staleness reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MetricCollector;
    use crate::mapping::SensorMetric;
    use crate::tracker::UpdateTracker;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn setup() -> (SharedTracker, SharedCollector, StalenessReaper) {
        let tracker = Arc::new(UpdateTracker::new());
        let collector = Arc::new(MetricCollector::new("qingping"));
        let reaper = StalenessReaper::new(tracker.clone(), collector.clone(), Duration::from_secs(60));
        (tracker, collector, reaper)
    }

    fn populate(tracker: &UpdateTracker, collector: &MetricCollector, device: &str, secs: i64) {
        tracker.record_with(device, at(secs), || {
            for metric in SensorMetric::ALL {
                collector.set(metric, device, secs as f64);
            }
        });
    }

    #[test]
    fn test_cutoff_is_twice_interval() {
        let (_, _, reaper) = setup();
        assert_eq!(reaper.cutoff(), Duration::from_secs(120));
    }

    #[test]
    fn test_cutoff_saturates() {
        let reaper = StalenessReaper::new(
            Arc::new(UpdateTracker::new()),
            Arc::new(MetricCollector::new("qingping")),
            Duration::from_secs(u64::MAX),
        );
        assert_eq!(reaper.cutoff(), Duration::MAX);
    }

    #[test]
    fn test_sweep_keeps_fresh_device() {
        let (tracker, collector, reaper) = setup();
        populate(&tracker, &collector, "office", 1000);

        assert!(reaper.sweep(at(1119)).is_empty());
        assert_eq!(collector.get(SensorMetric::Temperature, "office"), Some(1000.0));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_sweep_removes_stale_device_at_cutoff() {
        let (tracker, collector, reaper) = setup();
        populate(&tracker, &collector, "office", 1000);

        let reaped = reaper.sweep(at(1120));

        assert_eq!(
            reaped,
            vec![ReapedDevice {
                device: "office".to_string(),
                silence: Duration::from_secs(120),
            }]
        );
        for metric in SensorMetric::SENSORS {
            assert_eq!(collector.get(metric, "office"), None, "{metric} should be gone");
        }
        assert_eq!(collector.get(SensorMetric::LastUpdate, "office"), Some(1000.0));
        assert!(tracker.is_empty());
        assert_eq!(collector.stats().devices_reaped, 1);
    }

    #[test]
    fn test_sweep_only_touches_stale_devices() {
        let (tracker, collector, reaper) = setup();
        populate(&tracker, &collector, "office", 1000);
        populate(&tracker, &collector, "kitchen", 1100);

        let reaped = reaper.sweep(at(1150));

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].device, "office");
        assert_eq!(collector.get(SensorMetric::Humidity, "kitchen"), Some(1100.0));
        assert_eq!(tracker.devices(), vec!["kitchen".to_string()]);
    }

    #[test]
    fn test_untracked_device_is_never_reaped() {
        let (_, collector, reaper) = setup();
        collector.set(SensorMetric::Temperature, "ghost", 20.0);

        assert!(reaper.sweep(at(1_000_000)).is_empty());
        assert_eq!(collector.get(SensorMetric::Temperature, "ghost"), Some(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_, _, reaper) = setup();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reaper.run(rx));
        tokio::time::sleep(Duration::from_secs(150)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
