//! Battery telemetry.
//!
//! Readings arrive as raw `(level, scale)` pairs pushed by a source (manual
//! input on the panel, or the Linux sysfs poller below) and are turned into a
//! percentage before they reach the shutoff policy.

use crate::error::TelemetryError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Raw pair as pushed by a telemetry source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySample {
    pub level: i32,
    pub scale: i32,
}

impl TelemetrySample {
    pub fn new(level: i32, scale: i32) -> Self {
        Self { level, scale }
    }
}

/// Validated battery percentage, always within `0..=100`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    level: i32,
    scale: i32,
    percentage: f32,
}

impl TelemetryReading {
    pub fn new(level: i32, scale: i32) -> Result<Self, TelemetryError> {
        if scale <= 0 {
            return Err(TelemetryError::InvalidScale(scale));
        }
        if level < 0 {
            return Err(TelemetryError::MissingLevel(level));
        }
        if level > scale {
            return Err(TelemetryError::LevelAboveScale { level, scale });
        }
        let percentage = level as f32 * 100.0 / scale as f32;
        Ok(Self { level, scale, percentage })
    }

    pub fn percentage(&self) -> f32 {
        self.percentage
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }
}

impl TryFrom<TelemetrySample> for TelemetryReading {
    type Error = TelemetryError;

    fn try_from(sample: TelemetrySample) -> Result<Self, Self::Error> {
        Self::new(sample.level, sample.scale)
    }
}

impl fmt::Display for TelemetryReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.percentage)
    }
}

/// Parse the content of a `power_supply/*/capacity` file
pub fn parse_capacity(raw: &str) -> Option<i32> {
    raw.trim().parse::<i32>().ok()
}

/// Polls a sysfs capacity file and pushes a sample each time the value
/// changes. Stops when the receiving side is dropped.
pub fn spawn_sysfs_source(
    path: PathBuf,
    every: Duration,
    tx: mpsc::Sender<TelemetrySample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        let mut last: Option<i32> = None;
        let mut read_failed = false;

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let level = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match parse_capacity(&raw) {
                    Some(level) => level,
                    None => {
                        warn!("unparsable battery capacity in {}: {:?}", path.display(), raw.trim());
                        continue;
                    }
                },
                Err(e) => {
                    // un seul warning, sinon on spamme toutes les N secondes
                    if !read_failed {
                        warn!("cannot read battery capacity from {}: {}", path.display(), e);
                        read_failed = true;
                    }
                    continue;
                }
            };
            read_failed = false;

            if last == Some(level) {
                continue;
            }
            last = Some(level);

            debug!("battery capacity changed: {}%", level);
            if tx.send(TelemetrySample::new(level, 100)).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_is_level_times_100_over_scale() {
        for (level, scale) in [(0, 100), (79, 100), (80, 100), (100, 100), (1, 3), (150, 200)] {
            let reading = TelemetryReading::new(level, scale).unwrap();
            assert_eq!(reading.percentage(), level as f32 * 100.0 / scale as f32);
        }
    }

    #[test]
    fn test_invalid_scale_rejected() {
        assert_eq!(TelemetryReading::new(50, 0), Err(TelemetryError::InvalidScale(0)));
        assert_eq!(TelemetryReading::new(-1, -1), Err(TelemetryError::InvalidScale(-1)));
    }

    #[test]
    fn test_missing_or_overflowing_level_rejected() {
        assert_eq!(TelemetryReading::new(-1, 100), Err(TelemetryError::MissingLevel(-1)));
        assert_eq!(
            TelemetryReading::new(101, 100),
            Err(TelemetryError::LevelAboveScale { level: 101, scale: 100 })
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(TelemetryReading::new(80, 100).unwrap().to_string(), "80.0%");
        assert_eq!(TelemetryReading::new(1, 3).unwrap().to_string(), "33.3%");
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("87\n"), Some(87));
        assert_eq!(parse_capacity(" 5 "), Some(5));
        assert_eq!(parse_capacity("Full"), None);
    }

    #[tokio::test]
    async fn test_sysfs_source_pushes_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capacity");
        std::fs::write(&path, "42\n").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_sysfs_source(path.clone(), Duration::from_millis(10), tx);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(TelemetrySample::new(42, 100)));

        std::fs::write(&path, "43\n").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(second, Some(TelemetrySample::new(43, 100)));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
