//! satwatch: real-time state engine for a satellite mission-control dashboard.
//!
//! Telemetry and anomaly messages arrive over a WebSocket feed, are folded into
//! bounded stores, and come back out as immutable [`view::ViewSnapshot`]s.

pub mod anomalies;
pub mod app;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod history;
pub mod profiles;
pub mod types;
pub mod view;
pub mod ws;
