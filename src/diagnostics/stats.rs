use serde::Serialize;
use std::time::Instant;

/// Frame-delivery counters for a capture session.
///
/// The latest-frame slot is intentionally lossy, so dropped frames are
/// normal; the counters make the loss rate observable.
pub struct DeliveryStats {
    frame_count: u64,
    drop_count: u64,
    total_bytes: u64,
    start_time: Instant,
}

/// Serialisable snapshot of delivery stats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySnapshot {
    pub fps: f64,
    pub frame_count: u64,
    pub drop_count: u64,
    pub drop_rate: f64,
    pub bandwidth_bps: u64,
}

impl DeliveryStats {
    /// Create new stats with zeroed counters.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            drop_count: 0,
            total_bytes: 0,
            start_time: Instant::now(),
        }
    }

    /// Record a frame accepted into the latest-frame slot.
    pub fn record_frame(&mut self, bytes: usize) {
        self.frame_count += 1;
        self.total_bytes += bytes as u64;
    }

    /// Record a dropped delivery (gate closed, size mismatch, contention).
    pub fn record_drop(&mut self) {
        self.drop_count += 1;
    }

    /// Accepted frames per second since the stats were created.
    pub fn fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.frame_count as f64 / elapsed
    }

    /// Drop rate as a percentage (0.0 - 100.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.frame_count + self.drop_count;
        if total == 0 {
            return 0.0;
        }
        (self.drop_count as f64 / total as f64) * 100.0
    }

    /// Accepted bandwidth in bytes per second.
    pub fn bandwidth_bps(&self) -> u64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0;
        }
        (self.total_bytes as f64 / elapsed) as u64
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count
    }

    /// Take a serialisable snapshot.
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            fps: self.fps(),
            frame_count: self.frame_count,
            drop_count: self.drop_count,
            drop_rate: self.drop_rate(),
            bandwidth_bps: self.bandwidth_bps(),
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn initialises_with_zero_values() {
        let stats = DeliveryStats::new();
        assert_eq!(stats.frame_count(), 0);
        assert_eq!(stats.drop_count(), 0);
        assert_eq!(stats.drop_rate(), 0.0);
    }

    #[test]
    fn record_frame_increments_frame_count() {
        let mut stats = DeliveryStats::new();
        stats.record_frame(1000);
        stats.record_frame(1000);
        assert_eq!(stats.frame_count(), 2);
    }

    #[test]
    fn record_drop_increments_drop_count() {
        let mut stats = DeliveryStats::new();
        stats.record_drop();
        assert_eq!(stats.drop_count(), 1);
    }

    #[test]
    fn drop_rate_returns_percentage() {
        let mut stats = DeliveryStats::new();
        stats.record_frame(1000);
        stats.record_frame(1000);
        stats.record_drop();
        let rate = stats.drop_rate();
        assert!(
            (rate - 33.333).abs() < 1.0,
            "drop rate should be ~33%, got {rate}"
        );
    }

    #[test]
    fn fps_and_bandwidth_positive_after_frames() {
        let mut stats = DeliveryStats::new();
        stats.record_frame(10_000);
        thread::sleep(Duration::from_millis(20));
        assert!(stats.fps() > 0.0);
        assert!(stats.bandwidth_bps() > 0);
    }

    #[test]
    fn snapshot_produces_serialisable_data() {
        let mut stats = DeliveryStats::new();
        stats.record_frame(5000);
        let snap = stats.snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["frameCount"], 1);
        assert!(json["dropCount"].is_number());
        assert!(json["bandwidthBps"].is_number());
    }
}
