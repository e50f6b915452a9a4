//! Dashboard view state: local UI selections plus the stores they read from,
//! published as immutable snapshots over a watch channel.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::anomalies::AnomalyStore;
use crate::diagnostics::{
    build_records, known_satellites, sort_records, DiagnosticRecord, SortColumn, SortDirection,
    TableSort,
};
use crate::history::{push_capped, Sample, SeriesStats, TelemetryAggregator};
use crate::types::{AnomalyEvent, ConnectionState, Severity, StreamMessage};

const ACTIVITY_LOG_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tab {
    #[default]
    Mission,
    Systems,
    Logs,
    Settings,
}

impl FromStr for Tab {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mission" => Ok(Tab::Mission),
            "systems" => Ok(Tab::Systems),
            "logs" => Ok(Tab::Logs),
            "settings" => Ok(Tab::Settings),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tab::Mission => "mission",
            Tab::Systems => "systems",
            Tab::Logs => "logs",
            Tab::Settings => "settings",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRow {
    #[serde(flatten)]
    pub record: DiagnosticRecord,
    pub expanded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricView {
    pub series: Vec<Sample>,
    pub stats: Option<SeriesStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SatelliteView {
    pub id: String,
    pub latest: BTreeMap<String, f64>,
    pub metrics: BTreeMap<String, MetricView>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct FleetKpis {
    pub satellites: usize,
    pub open_anomalies: usize,
    pub open_critical: usize,
    pub open_warning: usize,
    pub acknowledged: usize,
}

/// Everything a renderer needs for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewSnapshot {
    pub revision: u64,
    pub tab: Tab,
    pub connection: ConnectionState,
    pub anomalies: Vec<AnomalyEvent>,
    pub diagnostics: Vec<DiagnosticRow>,
    pub sort: TableSort,
    pub selected: Option<SatelliteView>,
    pub kpis: FleetKpis,
    pub decode_errors: u64,
    pub activity: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct UiState {
    tab: Tab,
    selected: Option<String>,
    sort: TableSort,
    expanded: BTreeSet<String>,
}

pub struct DashboardViewState {
    anomalies: AnomalyStore,
    telemetry: TelemetryAggregator,
    connection: ConnectionState,
    decode_errors: u64,
    ui: UiState,
    activity: VecDeque<LogEntry>,
    log_seq: u64,
    revision: u64,
    // Some(dirty) while inside `batch`
    batching: Option<bool>,
    tx: watch::Sender<Arc<ViewSnapshot>>,
}

impl DashboardViewState {
    pub fn new(window_capacity: usize) -> Self {
        let anomalies = AnomalyStore::new();
        let telemetry = TelemetryAggregator::new(window_capacity);
        let ui = UiState::default();
        let initial = ViewSnapshot {
            revision: 0,
            tab: ui.tab,
            connection: ConnectionState::Connecting,
            anomalies: Vec::new(),
            diagnostics: Vec::new(),
            sort: ui.sort.clone(),
            selected: None,
            kpis: FleetKpis::default(),
            decode_errors: 0,
            activity: Vec::new(),
        };
        let (tx, _) = watch::channel(Arc::new(initial));
        Self {
            anomalies,
            telemetry,
            connection: ConnectionState::Connecting,
            decode_errors: 0,
            ui,
            activity: VecDeque::with_capacity(ACTIVITY_LOG_CAP),
            log_seq: 0,
            revision: 0,
            batching: None,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn anomalies(&self) -> &AnomalyStore {
        &self.anomalies
    }

    pub fn telemetry(&self) -> &TelemetryAggregator {
        &self.telemetry
    }

    /// Run several updates and publish at most one snapshot for all of them.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let outer = self.batching.replace(false);
        let out = f(self);
        let dirty = self.batching.take().unwrap_or(false);
        match outer {
            // nested: hand the dirty flag to the enclosing batch
            Some(outer_dirty) => self.batching = Some(outer_dirty || dirty),
            None if dirty => self.publish(),
            None => {}
        }
        out
    }

    // ---- stream input ----

    pub fn apply(&mut self, msg: &StreamMessage) {
        match msg {
            StreamMessage::Anomaly(ev) => self.anomalies.ingest(ev.clone()),
            StreamMessage::Metric(s) => {
                self.telemetry
                    .record(&s.satellite, &s.metric, s.value, s.timestamp)
            }
        }
        self.publish();
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        self.connection = state;
        self.log(format!("connection {state}"));
        self.publish();
    }

    pub fn set_decode_errors(&mut self, count: u64) {
        if self.decode_errors == count {
            return;
        }
        self.decode_errors = count;
        self.publish();
    }

    pub fn prune_anomalies_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let removed = self.anomalies.prune_before(cutoff);
        if removed > 0 {
            self.log(format!("expired {removed} anomalies"));
            self.publish();
        }
        removed
    }

    // ---- user commands ----

    pub fn acknowledge(&mut self, id: &str) {
        if self.anomalies.acknowledge(id) {
            self.log(format!("acknowledged {id}"));
        }
        self.publish();
    }

    /// Unknown tab names leave the current tab in place.
    pub fn select_tab(&mut self, name: &str) {
        if let Ok(tab) = name.parse() {
            self.ui.tab = tab;
        }
        self.publish();
    }

    /// Selecting a satellite that is not in the current set is a no-op.
    pub fn select_satellite(&mut self, id: &str) {
        if self.is_known(id) {
            self.ui.selected = Some(id.to_string());
        }
        self.publish();
    }

    pub fn clear_selection(&mut self) {
        self.ui.selected = None;
        self.publish();
    }

    pub fn set_sort(&mut self, column: SortColumn, direction: SortDirection) {
        self.ui.sort = TableSort { column, direction };
        self.publish();
    }

    /// Rows are keyed by satellite id; ids with no row are ignored.
    pub fn toggle_expand(&mut self, row_id: &str) {
        if !self.ui.expanded.remove(row_id) && self.is_known(row_id) {
            self.ui.expanded.insert(row_id.to_string());
        }
        self.publish();
    }

    fn is_known(&self, satellite: &str) -> bool {
        self.telemetry.contains(satellite) || self.anomalies.satellites().contains(satellite)
    }

    fn log(&mut self, message: String) {
        self.log_seq += 1;
        push_capped(
            &mut self.activity,
            LogEntry {
                seq: self.log_seq,
                message,
            },
            ACTIVITY_LOG_CAP,
        );
    }

    fn publish(&mut self) {
        if let Some(dirty) = self.batching.as_mut() {
            *dirty = true;
            return;
        }
        self.revision += 1;
        let snap = self.build();
        self.tx.send_replace(Arc::new(snap));
    }

    fn build(&self) -> ViewSnapshot {
        let mut records = build_records(&self.anomalies, &self.telemetry);
        sort_records(&mut records, &self.ui.sort);
        let diagnostics = records
            .into_iter()
            .map(|record| DiagnosticRow {
                expanded: self.ui.expanded.contains(&record.satellite),
                record,
            })
            .collect();

        let selected = self
            .ui
            .selected
            .as_deref()
            .filter(|id| self.is_known(id))
            .map(|id| self.satellite_view(id));

        ViewSnapshot {
            revision: self.revision,
            tab: self.ui.tab,
            connection: self.connection,
            anomalies: self.anomalies.all(),
            diagnostics,
            sort: self.ui.sort.clone(),
            selected,
            kpis: self.kpis(),
            decode_errors: self.decode_errors,
            activity: self.activity.iter().cloned().collect(),
        }
    }

    fn satellite_view(&self, id: &str) -> SatelliteView {
        let metrics = self
            .telemetry
            .metrics(id)
            .into_iter()
            .map(|m| {
                let view = MetricView {
                    series: self.telemetry.series(id, m),
                    stats: self.telemetry.stats(id, m),
                };
                (m.to_string(), view)
            })
            .collect();
        SatelliteView {
            id: id.to_string(),
            latest: self.telemetry.snapshot(id),
            metrics,
            last_seen: self.telemetry.last_seen(id),
        }
    }

    fn kpis(&self) -> FleetKpis {
        let mut k = FleetKpis {
            satellites: known_satellites(&self.anomalies, &self.telemetry).len(),
            acknowledged: self.anomalies.len() - self.anomalies.unacknowledged().count(),
            ..FleetKpis::default()
        };
        for ev in self.anomalies.unacknowledged() {
            k.open_anomalies += 1;
            match ev.severity {
                Severity::Critical => k.open_critical += 1,
                Severity::Warning => k.open_warning += 1,
                Severity::Info => {}
            }
        }
        k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricSample, Severity};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn anomaly(id: &str, sat: &str, severity: Severity, ts: i64) -> StreamMessage {
        StreamMessage::Anomaly(AnomalyEvent {
            id: id.into(),
            satellite: sat.into(),
            severity,
            metric: "temp".into(),
            value: "95C".into(),
            timestamp: t(ts),
            acknowledged: false,
        })
    }

    fn metric(sat: &str, name: &str, value: f64, ts: i64) -> StreamMessage {
        StreamMessage::Metric(MetricSample {
            satellite: sat.into(),
            metric: name.into(),
            value,
            timestamp: t(ts),
        })
    }

    fn seeded() -> DashboardViewState {
        let mut v = DashboardViewState::new(8);
        v.apply(&anomaly("a1", "SAT-1", Severity::Critical, 0));
        v.apply(&anomaly("a2", "SAT-1", Severity::Warning, 10));
        v.apply(&metric("SAT-1", "cpu", 40.0, 1));
        v.apply(&metric("SAT-2", "cpu", 70.0, 2));
        v
    }

    #[test]
    fn every_mutation_publishes_a_newer_snapshot() {
        let mut v = seeded();
        let rx = v.subscribe();
        let r0 = v.snapshot().revision;
        v.select_tab("systems");
        let r1 = rx.borrow().revision;
        assert!(r1 > r0);
        assert_eq!(rx.borrow().tab, Tab::Systems);
        v.select_tab("nonsense");
        assert!(v.snapshot().revision > r1);
        assert_eq!(v.snapshot().tab, Tab::Systems);
    }

    #[test]
    fn acknowledge_reflects_in_anomalies_diagnostics_and_kpis() {
        let mut v = seeded();
        let snap = v.snapshot();
        let ids: Vec<_> = snap.anomalies.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["a1", "a2"]);
        assert_eq!(snap.kpis.open_critical, 1);
        assert_eq!(snap.diagnostics[0].record.satellite, "SAT-1");

        v.acknowledge("a1");
        v.acknowledge("a1");
        v.acknowledge("ghost");
        let snap = v.snapshot();
        let ids: Vec<_> = snap.anomalies.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["a1", "a2"]);
        assert!(snap.anomalies[0].acknowledged);
        assert_eq!(snap.kpis.open_critical, 0);
        assert_eq!(snap.kpis.open_warning, 1);
        assert_eq!(snap.kpis.acknowledged, 1);
        let acks = snap
            .activity
            .iter()
            .filter(|e| e.message == "acknowledged a1")
            .count();
        assert_eq!(acks, 1);
    }

    #[test]
    fn selection_ignores_unknown_satellites() {
        let mut v = seeded();
        v.select_satellite("SAT-2");
        v.select_satellite("SAT-99");
        let snap = v.snapshot();
        let sel = snap.selected.as_ref().unwrap();
        assert_eq!(sel.id, "SAT-2");
        assert_eq!(sel.latest["cpu"], 70.0);
        assert_eq!(sel.metrics["cpu"].series.len(), 1);
        v.clear_selection();
        assert!(v.snapshot().selected.is_none());
    }

    #[test]
    fn sort_and_expand_shape_the_table() {
        let mut v = seeded();
        v.set_sort("cpu".parse().unwrap(), SortDirection::Desc);
        let order: Vec<_> = v
            .snapshot()
            .diagnostics
            .iter()
            .map(|r| r.record.satellite.clone())
            .collect();
        assert_eq!(order, ["SAT-2", "SAT-1"]);

        v.toggle_expand("SAT-1");
        v.toggle_expand("SAT-404");
        let snap = v.snapshot();
        let expanded: Vec<_> = snap
            .diagnostics
            .iter()
            .filter(|r| r.expanded)
            .map(|r| r.record.satellite.as_str())
            .collect();
        assert_eq!(expanded, ["SAT-1"]);
        v.toggle_expand("SAT-1");
        assert!(v.snapshot().diagnostics.iter().all(|r| !r.expanded));
    }

    #[test]
    fn connection_changes_are_logged_once() {
        let mut v = DashboardViewState::new(4);
        v.set_connection(ConnectionState::Live);
        let rev = v.snapshot().revision;
        v.set_connection(ConnectionState::Live);
        assert_eq!(v.snapshot().revision, rev);
        v.set_connection(ConnectionState::Reconnecting);
        let snap = v.snapshot();
        let msgs: Vec<_> = snap.activity.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, ["connection live", "connection reconnecting"]);
        assert_eq!(snap.connection, ConnectionState::Reconnecting);
    }

    #[test]
    fn ui_commands_do_not_depend_on_connection_state() {
        let mut v = seeded();
        v.set_connection(ConnectionState::Offline);
        v.select_tab("logs");
        v.select_satellite("SAT-1");
        let snap = v.snapshot();
        assert_eq!(snap.tab, Tab::Logs);
        assert_eq!(snap.selected.as_ref().map(|s| s.id.as_str()), Some("SAT-1"));
    }

    #[test]
    fn pruning_expires_old_anomalies() {
        let mut v = seeded();
        assert_eq!(v.prune_anomalies_before(t(5)), 1);
        let snap = v.snapshot();
        assert_eq!(snap.anomalies.len(), 1);
        assert_eq!(snap.anomalies[0].id, "a2");
        assert!(v.anomalies().get("a1").is_none());
        assert_eq!(v.anomalies().len(), 1);
    }

    #[test]
    fn batch_publishes_once_for_many_updates() {
        let mut v = DashboardViewState::new(8);
        let rx = v.subscribe();
        let before = v.snapshot().revision;
        v.batch(|v| {
            v.apply(&anomaly("a1", "SAT-1", Severity::Critical, 0));
            v.apply(&metric("SAT-1", "cpu", 40.0, 1));
            v.batch(|v| v.set_connection(ConnectionState::Live));
            v.apply(&metric("SAT-1", "cpu", 41.0, 2));
        });
        let snap = v.snapshot();
        assert_eq!(snap.revision, before + 1);
        assert_eq!(rx.borrow().revision, snap.revision);
        assert_eq!(snap.anomalies.len(), 1);
        assert_eq!(snap.connection, ConnectionState::Live);
        assert_eq!(v.telemetry().series("SAT-1", "cpu").len(), 2);
    }

    #[test]
    fn batch_without_changes_publishes_nothing() {
        let mut v = seeded();
        let before = v.snapshot().revision;
        v.batch(|v| {
            v.set_connection(ConnectionState::Connecting);
            v.set_decode_errors(0);
        });
        assert_eq!(v.snapshot().revision, before);
        v.select_tab("logs");
        assert_eq!(v.snapshot().revision, before + 1);
    }
}
