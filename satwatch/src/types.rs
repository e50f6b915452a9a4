//! Types that mirror the telemetry backend's JSON schema, plus the frame decoder.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(alias = "critical", alias = "CRITICAL")]
    Critical,
    #[serde(alias = "warning", alias = "WARNING")]
    Warning,
    #[serde(alias = "info", alias = "INFO")]
    Info,
}

impl Severity {
    /// Ordinal used for sorting; higher is more severe.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 2,
            Severity::Warning => 1,
            Severity::Info => 0,
        }
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: String,
    pub satellite: String,
    pub severity: Severity,
    pub metric: String,
    pub value: String,
    // generation time at the source, not receipt time
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub satellite: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Anomaly(AnomalyEvent),
    Metric(MetricSample),
}

// Wire shape; `Unknown` swallows message types this client does not know yet.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Anomaly {
        event: AnomalyEvent,
    },
    Metric(MetricSample),
    #[serde(other)]
    Unknown,
}

/// Decode one text frame. `Ok(None)` means the frame was well-formed but of a
/// type this client ignores.
pub fn decode_frame(text: &str) -> Result<Option<StreamMessage>, DecodeError> {
    let msg = match serde_json::from_str::<WireMessage>(text)? {
        WireMessage::Anomaly { event } => Some(StreamMessage::Anomaly(event)),
        WireMessage::Metric(sample) => Some(StreamMessage::Metric(sample)),
        WireMessage::Unknown => None,
    };
    Ok(msg)
}

/// Binary frames carry the same JSON, just not flagged as text.
pub fn decode_binary_frame(bytes: &[u8]) -> Result<Option<StreamMessage>, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::Utf8)?;
    decode_frame(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Live,
    Reconnecting,
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline => "offline",
        };
        f.write_str(label)
    }
}
