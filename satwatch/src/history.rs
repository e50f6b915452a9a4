//! Bounded per-satellite metric history for charts and KPI tiles.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if dq.len() == cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub latest: f64,
}

/// Keeps a fixed-capacity FIFO window per (satellite, metric) pair.
#[derive(Debug)]
pub struct TelemetryAggregator {
    // satellite -> metric -> window, in arrival order
    windows: BTreeMap<String, BTreeMap<String, VecDeque<Sample>>>,
    cap: usize,
}

impl TelemetryAggregator {
    pub fn new(cap: usize) -> Self {
        Self {
            windows: BTreeMap::new(),
            cap: cap.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn record(&mut self, satellite: &str, metric: &str, value: f64, timestamp: DateTime<Utc>) {
        let cap = self.cap;
        let window = self
            .windows
            .entry(satellite.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_insert_with(|| VecDeque::with_capacity(cap));
        push_capped(window, Sample { timestamp, value }, cap);
    }

    /// Current window sorted by timestamp; equal timestamps keep arrival order.
    pub fn series(&self, satellite: &str, metric: &str) -> Vec<Sample> {
        let mut out: Vec<Sample> = self
            .window(satellite, metric)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();
        out.sort_by_key(|s| s.timestamp);
        out
    }

    /// Latest value per metric for one satellite.
    pub fn snapshot(&self, satellite: &str) -> BTreeMap<String, f64> {
        let Some(metrics) = self.windows.get(satellite) else {
            return BTreeMap::new();
        };
        metrics
            .iter()
            .filter_map(|(name, w)| latest(w).map(|s| (name.clone(), s.value)))
            .collect()
    }

    pub fn stats(&self, satellite: &str, metric: &str) -> Option<SeriesStats> {
        let w = self.window(satellite, metric)?;
        let last = latest(w)?;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for s in w {
            min = min.min(s.value);
            max = max.max(s.value);
            sum += s.value;
        }
        Some(SeriesStats {
            min,
            max,
            mean: sum / w.len() as f64,
            latest: last.value,
        })
    }

    pub fn satellites(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    pub fn contains(&self, satellite: &str) -> bool {
        self.windows.contains_key(satellite)
    }

    pub fn metrics(&self, satellite: &str) -> Vec<&str> {
        self.windows
            .get(satellite)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Newest sample timestamp across all metrics of a satellite.
    pub fn last_seen(&self, satellite: &str) -> Option<DateTime<Utc>> {
        self.windows
            .get(satellite)?
            .values()
            .filter_map(|w| w.iter().map(|s| s.timestamp).max())
            .max()
    }

    fn window(&self, satellite: &str, metric: &str) -> Option<&VecDeque<Sample>> {
        self.windows.get(satellite)?.get(metric)
    }
}

// Greatest timestamp wins; on ties the later arrival.
fn latest(w: &VecDeque<Sample>) -> Option<&Sample> {
    w.iter().max_by_key(|s| s.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn push_capped_evicts_oldest() {
        let mut dq = VecDeque::new();
        for i in 0..5 {
            push_capped(&mut dq, i, 3);
        }
        assert_eq!(dq, VecDeque::from(vec![2, 3, 4]));
    }

    #[test]
    fn window_is_bounded_to_most_recent_samples() {
        let mut agg = TelemetryAggregator::new(4);
        for i in 0..10 {
            agg.record("SAT-1", "cpu", i as f64, t(i));
        }
        let series = agg.series("SAT-1", "cpu");
        assert_eq!(series.len(), 4);
        let values: Vec<f64> = series.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![6.0, 7.0, 8.0, 9.0]);
        assert!(series.windows(2).all(|p| p[0].timestamp <= p[1].timestamp));
    }

    #[test]
    fn series_is_time_ordered_when_arrival_is_not() {
        let mut agg = TelemetryAggregator::new(8);
        agg.record("SAT-1", "lat", 3.0, t(30));
        agg.record("SAT-1", "lat", 1.0, t(10));
        agg.record("SAT-1", "lat", 2.0, t(20));
        let values: Vec<f64> = agg.series("SAT-1", "lat").iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        // latest by generation time, not arrival
        assert_eq!(agg.snapshot("SAT-1").get("lat"), Some(&3.0));
    }

    #[test]
    fn snapshot_and_stats_per_metric() {
        let mut agg = TelemetryAggregator::new(8);
        agg.record("SAT-1", "cpu", 10.0, t(0));
        agg.record("SAT-1", "cpu", 30.0, t(1));
        agg.record("SAT-1", "latency", 120.0, t(1));
        let snap = agg.snapshot("SAT-1");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["cpu"], 30.0);
        let st = agg.stats("SAT-1", "cpu").unwrap();
        assert_eq!((st.min, st.max, st.mean, st.latest), (10.0, 30.0, 20.0, 30.0));
        assert_eq!(agg.last_seen("SAT-1"), Some(t(1)));
        assert!(agg.snapshot("SAT-404").is_empty());
        assert!(agg.series("SAT-404", "cpu").is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut agg = TelemetryAggregator::new(0);
        agg.record("S", "m", 1.0, t(0));
        agg.record("S", "m", 2.0, t(1));
        assert_eq!(agg.capacity(), 1);
        assert_eq!(agg.series("S", "m").len(), 1);
    }
}
