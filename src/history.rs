//! Range-scoped history buffers
//!
//! A [`HistoryBuffer`] is an ordered, bounded, duplicate-free sequence of
//! [`HistoryPoint`]s. [`HistoryState`] wraps one buffer together with the
//! currently selected [`HistoryRange`] and the "loading" flag, and holds all
//! the rules the correlator applies to requests, responses and live points.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SystemMetrics;

/// Lookback window selectable by a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HistoryRange {
    #[default]
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    TwentyFourHours,
    #[serde(rename = "7d")]
    SevenDays,
}

impl HistoryRange {
    pub const ALL: [HistoryRange; 4] = [
        HistoryRange::OneHour,
        HistoryRange::SixHours,
        HistoryRange::TwentyFourHours,
        HistoryRange::SevenDays,
    ];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryRange::OneHour => "1h",
            HistoryRange::SixHours => "6h",
            HistoryRange::TwentyFourHours => "24h",
            HistoryRange::SevenDays => "7d",
        }
    }

    pub fn lookback(&self) -> Duration {
        match self {
            HistoryRange::OneHour => Duration::from_secs(3600),
            HistoryRange::SixHours => Duration::from_secs(6 * 3600),
            HistoryRange::TwentyFourHours => Duration::from_secs(24 * 3600),
            HistoryRange::SevenDays => Duration::from_secs(7 * 24 * 3600),
        }
    }

    /// Maximum number of buffered points while this range is active.
    ///
    /// Agents push a snapshot every 5 seconds, so the last-hour window keeps a
    /// full hour of live ticks; coarser windows keep fewer, wider-spaced points.
    pub fn max_points(&self) -> usize {
        match self {
            HistoryRange::OneHour => 720,
            HistoryRange::SixHours => 360,
            HistoryRange::TwentyFourHours => 288,
            HistoryRange::SevenDays => 168,
        }
    }
}

impl fmt::Display for HistoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HistoryRange::ALL
            .into_iter()
            .find(|range| range.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown history range: {s}"))
    }
}

/// One sample of a host's utilisation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "memory")]
    pub memory_percent: f64,
    #[serde(rename = "disk")]
    pub disk_percent: f64,
}

impl HistoryPoint {
    pub fn from_snapshot(metrics: &SystemMetrics) -> Self {
        Self {
            timestamp: metrics.timestamp,
            cpu_percent: metrics.cpu.usage_percent,
            memory_percent: metrics.memory_percent(),
            disk_percent: metrics.disk.percent,
        }
    }
}

/// Ordered, bounded sequence of history points
///
/// Timestamps are strictly increasing; when the capacity is exceeded the
/// oldest points are evicted from the front.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Replace the whole buffer with `points`.
    ///
    /// Points are sorted by timestamp and points sharing a timestamp collapse
    /// to the last one seen. Only the newest `capacity` points are kept.
    pub fn replace(&mut self, mut points: Vec<HistoryPoint>) {
        // stable sort keeps arrival order among equal timestamps
        points.sort_by_key(|point| point.timestamp);

        self.points.clear();
        for point in points {
            match self.points.back_mut() {
                Some(last) if last.timestamp == point.timestamp => *last = point,
                _ => self.points.push_back(point),
            }
        }

        self.trim();
    }

    /// Append a point at the tail.
    ///
    /// Returns `false` (and leaves the buffer untouched) if the point is not
    /// newer than the current last point.
    pub fn append(&mut self, point: HistoryPoint) -> bool {
        if let Some(last) = self.points.back()
            && point.timestamp <= last.timestamp
        {
            return false;
        }

        self.points.push_back(point);
        self.trim();
        true
    }

    fn trim(&mut self) {
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }
}

/// Read-only copy of one host's history, handed to viewers and observers
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryView {
    pub host_id: String,
    pub range: HistoryRange,
    pub loading: bool,
    pub points: Vec<HistoryPoint>,
}

/// History bookkeeping for one host and one active range
#[derive(Debug, Clone)]
pub struct HistoryState {
    range: HistoryRange,
    loading: bool,
    buffer: HistoryBuffer,
}

impl HistoryState {
    pub fn new(range: HistoryRange) -> Self {
        Self {
            range,
            loading: false,
            buffer: HistoryBuffer::new(range.max_points()),
        }
    }

    pub fn range(&self) -> HistoryRange {
        self.range
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn buffer(&self) -> &HistoryBuffer {
        &self.buffer
    }

    /// Switch to `range`. Points buffered for a different range are dropped.
    ///
    /// Returns `true` if the range actually changed.
    pub fn select_range(&mut self, range: HistoryRange) -> bool {
        if range == self.range {
            return false;
        }

        self.range = range;
        self.loading = false;
        self.buffer = HistoryBuffer::new(range.max_points());
        true
    }

    /// Mark a request for the current range as in flight
    pub fn begin_request(&mut self) -> HistoryRange {
        self.loading = true;
        self.range
    }

    /// Give up on the in-flight request so live points flow again
    pub fn abandon_request(&mut self) -> bool {
        std::mem::replace(&mut self.loading, false)
    }

    /// Apply a history response. Responses for any range other than the
    /// current one are ignored and `false` is returned.
    pub fn accept_response(&mut self, range: HistoryRange, points: Vec<HistoryPoint>) -> bool {
        if range != self.range {
            return false;
        }

        self.buffer.replace(points);
        self.loading = false;
        true
    }

    /// Append a live point unless a request is in flight or the point is not
    /// newer than the last buffered one.
    pub fn push_live(&mut self, point: HistoryPoint) -> bool {
        if self.loading {
            return false;
        }
        self.buffer.append(point)
    }

    pub fn view(&self, host_id: &str) -> HistoryView {
        HistoryView {
            host_id: host_id.to_string(),
            range: self.range,
            loading: self.loading,
            points: self.buffer.to_vec(),
        }
    }
}

impl Default for HistoryState {
    fn default() -> Self {
        Self::new(HistoryRange::default())
    }
}
