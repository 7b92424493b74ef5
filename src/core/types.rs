use crate::core::error::{CinderError, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

/// A metric name together with its accumulated samples.
///
/// The sample sequence is append-only while the value lives in the cache,
/// and ordered by arrival. Equality is structural on the name and the full
/// sequence, order-sensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Points {
    /// Metric name.
    pub metric: String,
    /// Ordered samples.
    pub data: Vec<Point>,
}

impl Points {
    /// Creates a Points carrying a single sample.
    pub fn one_point(metric: &str, value: f64, timestamp: i64) -> Self {
        Points {
            metric: metric.to_string(),
            data: vec![Point { timestamp, value }],
        }
    }

    /// Creates a Points carrying a single sample stamped with the current time.
    pub fn now_point(metric: &str, value: f64) -> Self {
        Self::one_point(metric, value, unix_now())
    }

    /// Appends one sample, preserving arrival order.
    pub fn append(mut self, timestamp: i64, value: f64) -> Self {
        self.data.push(Point { timestamp, value });
        self
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no samples are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parses one line of the plaintext protocol: `<metric> <value> <timestamp>`.
    ///
    /// A trailing `\n` and an optional `\r` before it are accepted. The metric
    /// must be non-empty and free of whitespace, the value must be a finite
    /// 64-bit float, and the timestamp a non-negative 64-bit integer.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut fields = line.split(' ');
        let (metric, value, timestamp) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(m), Some(v), Some(t), None) => (m, v, t),
                _ => {
                    return Err(CinderError::parse(format!(
                        "expected 3 space-separated fields: {:?}",
                        line
                    )))
                },
            };

        if metric.is_empty() || metric.chars().any(char::is_whitespace) {
            return Err(CinderError::parse(format!("invalid metric name: {:?}", metric)));
        }

        let value: f64 = value
            .parse()
            .map_err(|_| CinderError::parse(format!("invalid value: {:?}", value)))?;
        if !value.is_finite() {
            return Err(CinderError::parse(format!("non-finite value: {:?}", value)));
        }

        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| CinderError::parse(format!("invalid timestamp: {:?}", timestamp)))?;
        if timestamp < 0 {
            return Err(CinderError::parse(format!("negative timestamp: {}", timestamp)));
        }

        Ok(Self::one_point(metric, value, timestamp))
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
