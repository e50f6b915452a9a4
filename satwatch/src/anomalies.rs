//! Anomaly events keyed by id, kept in arrival order and read back in severity order.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::types::AnomalyEvent;

#[derive(Debug, Default)]
pub struct AnomalyStore {
    // arrival order; `index` maps id -> position
    events: Vec<AnomalyEvent>,
    index: HashMap<String, usize>,
}

impl AnomalyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new event or update an existing one with the same id in place.
    /// An acknowledged record stays acknowledged whatever the resend says.
    pub fn ingest(&mut self, event: AnomalyEvent) {
        match self.index.get(&event.id) {
            Some(&pos) => {
                let slot = &mut self.events[pos];
                let acknowledged = slot.acknowledged || event.acknowledged;
                *slot = event;
                slot.acknowledged = acknowledged;
            }
            None => {
                self.index.insert(event.id.clone(), self.events.len());
                self.events.push(event);
            }
        }
    }

    /// Returns true only when the record existed and was not yet acknowledged.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        let Some(&pos) = self.index.get(id) else {
            return false;
        };
        let ev = &mut self.events[pos];
        let changed = !ev.acknowledged;
        ev.acknowledged = true;
        changed
    }

    /// Most severe first, then most recent; arrival order on full ties.
    pub fn all(&self) -> Vec<AnomalyEvent> {
        let mut out = self.events.clone();
        out.sort_by(display_order);
        out
    }

    pub fn unacknowledged_by_satellite(&self, satellite: &str) -> Option<&AnomalyEvent> {
        self.events
            .iter()
            .filter(|e| !e.acknowledged && e.satellite == satellite)
            .fold(None, |best: Option<&AnomalyEvent>, e| match best {
                Some(b) if display_order(b, e) != Ordering::Greater => Some(b),
                _ => Some(e),
            })
    }

    pub fn unacknowledged_count_for(&self, satellite: &str) -> usize {
        self.events
            .iter()
            .filter(|e| !e.acknowledged && e.satellite == satellite)
            .count()
    }

    pub fn unacknowledged(&self) -> impl Iterator<Item = &AnomalyEvent> {
        self.events.iter().filter(|e| !e.acknowledged)
    }

    pub fn get(&self, id: &str) -> Option<&AnomalyEvent> {
        self.index.get(id).map(|&pos| &self.events[pos])
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn satellites(&self) -> BTreeSet<&str> {
        self.events.iter().map(|e| e.satellite.as_str()).collect()
    }

    /// Drop events generated before `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.timestamp >= cutoff);
        let removed = before - self.events.len();
        if removed > 0 {
            self.index = self
                .events
                .iter()
                .enumerate()
                .map(|(pos, e)| (e.id.clone(), pos))
                .collect();
        }
        removed
    }
}

fn display_order(a: &AnomalyEvent, b: &AnomalyEvent) -> Ordering {
    b.severity
        .rank()
        .cmp(&a.severity.rank())
        .then_with(|| b.timestamp.cmp(&a.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn ev(id: &str, sat: &str, severity: Severity, ts: i64) -> AnomalyEvent {
        AnomalyEvent {
            id: id.into(),
            satellite: sat.into(),
            severity,
            metric: "temp".into(),
            value: "95C".into(),
            timestamp: t(ts),
            acknowledged: false,
        }
    }

    fn ids(store: &AnomalyStore) -> Vec<String> {
        store.all().into_iter().map(|e| e.id).collect()
    }

    #[test]
    fn critical_before_warning_then_ack_keeps_order() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("a1", "SAT-1", Severity::Critical, 0));
        s.ingest(ev("a2", "SAT-1", Severity::Warning, 10));
        assert_eq!(ids(&s), ["a1", "a2"]);

        assert!(s.acknowledge("a1"));
        let all = s.all();
        assert_eq!(all[0].id, "a1");
        assert!(all[0].acknowledged);
        assert_eq!(all[1].id, "a2");
    }

    #[test]
    fn upsert_keeps_one_record_with_latest_value() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("a1", "SAT-1", Severity::Warning, 0));
        let mut again = ev("a1", "SAT-1", Severity::Warning, 0);
        again.value = "99C".into();
        s.ingest(again);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get("a1").unwrap().value, "99C");
    }

    #[test]
    fn resend_never_reverts_acknowledgement() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("a1", "SAT-1", Severity::Critical, 0));
        s.acknowledge("a1");
        s.ingest(ev("a1", "SAT-1", Severity::Critical, 0));
        assert!(s.get("a1").unwrap().acknowledged);
    }

    #[test]
    fn acknowledge_is_idempotent_and_total() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("a1", "SAT-1", Severity::Info, 0));
        s.ingest(ev("a2", "SAT-2", Severity::Critical, 5));
        let before = ids(&s);
        assert!(s.acknowledge("a1"));
        assert!(!s.acknowledge("a1"));
        assert!(!s.acknowledge("missing"));
        assert_eq!(ids(&s), before);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn ordering_is_severity_then_recency_and_stable_on_ties() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("w-old", "S", Severity::Warning, 1));
        s.ingest(ev("i", "S", Severity::Info, 9));
        s.ingest(ev("tie-1", "S", Severity::Warning, 5));
        s.ingest(ev("c", "S", Severity::Critical, 0));
        s.ingest(ev("tie-2", "S", Severity::Warning, 5));
        assert_eq!(ids(&s), ["c", "tie-1", "tie-2", "w-old", "i"]);
    }

    #[test]
    fn worst_unacknowledged_per_satellite() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("a", "SAT-1", Severity::Warning, 0));
        s.ingest(ev("b", "SAT-1", Severity::Critical, 1));
        s.ingest(ev("c", "SAT-2", Severity::Info, 2));
        assert_eq!(s.unacknowledged_by_satellite("SAT-1").unwrap().id, "b");
        s.acknowledge("b");
        assert_eq!(s.unacknowledged_by_satellite("SAT-1").unwrap().id, "a");
        s.acknowledge("a");
        assert!(s.unacknowledged_by_satellite("SAT-1").is_none());
        assert!(s.unacknowledged_by_satellite("SAT-9").is_none());
    }

    #[test]
    fn prune_drops_expired_and_reindexes() {
        let mut s = AnomalyStore::new();
        s.ingest(ev("old", "SAT-1", Severity::Critical, 0));
        s.ingest(ev("new", "SAT-1", Severity::Warning, 100));
        assert_eq!(s.prune_before(t(50)), 1);
        assert!(s.get("old").is_none());
        assert!(!s.acknowledge("old"));
        assert!(s.acknowledge("new"));
        s.ingest(ev("newer", "SAT-1", Severity::Info, 200));
        assert_eq!(s.get("newer").unwrap().id, "newer");
        assert_eq!(s.len(), 2);
    }
}
