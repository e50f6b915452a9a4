//! Per-satellite diagnostics rows derived from the anomaly store and telemetry,
//! and the table sort applied to them.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::anomalies::AnomalyStore;
use crate::history::TelemetryAggregator;
use crate::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Nominal,
    Warning,
    Critical,
}

impl Status {
    pub fn rank(self) -> u8 {
        match self {
            Status::Critical => 2,
            Status::Warning => 1,
            Status::Nominal => 0,
        }
    }

    pub fn from_worst(severity: Option<Severity>) -> Self {
        match severity {
            Some(Severity::Critical) => Status::Critical,
            Some(Severity::Warning) => Status::Warning,
            Some(Severity::Info) | None => Status::Nominal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub satellite: String,
    pub status: Status,
    pub open_anomalies: usize,
    pub last_seen: Option<DateTime<Utc>>,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum SortColumn {
    Status,
    Satellite,
    OpenAnomalies,
    LastSeen,
    Metric(String),
}

impl FromStr for SortColumn {
    type Err = std::convert::Infallible;

    // Anything that is not a fixed column names a metric.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "status" => SortColumn::Status,
            "satellite" | "id" => SortColumn::Satellite,
            "anomalies" | "open" | "open_anomalies" => SortColumn::OpenAnomalies,
            "last_seen" | "seen" => SortColumn::LastSeen,
            _ => SortColumn::Metric(s.trim().to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" | "up" => Ok(SortDirection::Asc),
            "desc" | "descending" | "down" => Ok(SortDirection::Desc),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSort {
    pub column: SortColumn,
    pub direction: SortDirection,
}

impl Default for TableSort {
    fn default() -> Self {
        Self {
            column: SortColumn::Status,
            direction: SortDirection::Desc,
        }
    }
}

/// Satellites seen in telemetry or named by any retained anomaly.
pub fn known_satellites(anomalies: &AnomalyStore, telemetry: &TelemetryAggregator) -> BTreeSet<String> {
    let mut out: BTreeSet<String> = telemetry.satellites().map(str::to_string).collect();
    out.extend(anomalies.satellites().into_iter().map(str::to_string));
    out
}

pub fn build_records(anomalies: &AnomalyStore, telemetry: &TelemetryAggregator) -> Vec<DiagnosticRecord> {
    known_satellites(anomalies, telemetry)
        .into_iter()
        .map(|sat| {
            let worst = anomalies.unacknowledged_by_satellite(&sat).map(|e| e.severity);
            DiagnosticRecord {
                status: Status::from_worst(worst),
                open_anomalies: anomalies.unacknowledged_count_for(&sat),
                last_seen: telemetry.last_seen(&sat),
                metrics: telemetry.snapshot(&sat),
                satellite: sat,
            }
        })
        .collect()
}

pub fn sort_records(rows: &mut [DiagnosticRecord], sort: &TableSort) {
    rows.sort_by(|a, b| {
        let primary = match &sort.column {
            SortColumn::Status => a.status.rank().cmp(&b.status.rank()),
            SortColumn::Satellite => Ordering::Equal,
            SortColumn::OpenAnomalies => a.open_anomalies.cmp(&b.open_anomalies),
            SortColumn::LastSeen => a.last_seen.cmp(&b.last_seen),
            SortColumn::Metric(name) => cmp_metric(a.metrics.get(name), b.metrics.get(name)),
        };
        let primary = match sort.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        // Satellite column sorts by id itself; everything else tie-breaks on it ascending.
        let by_id = a.satellite.cmp(&b.satellite);
        match (&sort.column, sort.direction) {
            (SortColumn::Satellite, SortDirection::Desc) => by_id.reverse(),
            _ => primary.then(by_id),
        }
    });
}

// Missing values sort below any present value.
fn cmp_metric(a: Option<&f64>, b: Option<&f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
