// Reconciliation engine - Merges canonical events into machine views
use crate::domain::event::{
    CanonicalEvent, EventKind, EventOrigin, Field, MachinePatch, StationPatch, StopEffect,
    StopPatch, TouchSet,
};
use crate::domain::machine::{
    ActiveStop, CounterRecord, LastStop, MachineId, MachineSnapshot, MachineView, StationSnapshot,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Largest window `Duration::seconds` accepts.
const MAX_WINDOW_SECS: i64 = i64::MAX / 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// How long after an accepted update an all-zero counter set is treated
    /// as a regression.
    pub freshness_window: Duration,
}

impl ReconcileSettings {
    pub fn from_secs(freshness_window_secs: u64) -> Self {
        Self {
            freshness_window: Duration::seconds(
                i64::try_from(freshness_window_secs)
                    .unwrap_or(i64::MAX)
                    .min(MAX_WINDOW_SECS),
            ),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from_secs(120)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("view is uninitialized and a '{0}' event cannot populate it")]
    Uninitialized(&'static str),
    #[error("initializing event carries no machine data")]
    EmptyInitialization,
    #[error("machine {0} is not tracked by this view")]
    UnknownTarget(MachineId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Applied(Arc<MachineView>),
    /// Nothing observable changed; the current view stays as is.
    Unchanged,
    Rejected(RejectReason),
}

/// Merge one event into the view of `tracked`.
///
/// `current` is `None` while the view is uninitialized. Only full-context events
/// and command responses addressed to `tracked` can populate it.
pub fn reconcile(
    current: Option<&Arc<MachineView>>,
    tracked: MachineId,
    event: &CanonicalEvent,
    now: DateTime<Utc>,
    settings: &ReconcileSettings,
) -> Reconciliation {
    let mut next = match current {
        Some(view) => MachineView::clone(view),
        None => {
            if !event.kind.may_initialize() {
                return Reconciliation::Rejected(RejectReason::Uninitialized(event.kind.as_str()));
            }
            if event.target != tracked {
                return Reconciliation::Rejected(RejectReason::UnknownTarget(event.target));
            }
            let has_stations = event.stations.as_ref().is_some_and(|s| !s.is_empty());
            if event.machine.is_empty() && !has_stations {
                return Reconciliation::Rejected(RejectReason::EmptyInitialization);
            }
            MachineView::new(MachineSnapshot::empty(tracked))
        }
    };

    let touches = event.kind.touches();
    let machine_id = next.machine.id;

    if event.target == machine_id {
        merge_snapshot(&mut next.machine, &event.machine, event.kind, touches, now, settings);
    } else if let Some(station) = next.stations.get_mut(&event.target) {
        merge_snapshot(&mut station.snapshot, &event.machine, event.kind, touches, now, settings);
    } else if event.kind.may_add_stations()
        && event.machine.parent_id.as_value() == Some(&machine_id)
    {
        let index = next_station_index(&next.stations);
        let mut station = new_station(event.target, index, machine_id);
        merge_snapshot(&mut station.snapshot, &event.machine, event.kind, touches, now, settings);
        next.stations.insert(event.target, station);
    } else {
        return Reconciliation::Rejected(RejectReason::UnknownTarget(event.target));
    }

    if let Some(stations) = &event.stations {
        merge_stations(&mut next, stations, event, now, settings);
    }

    match current {
        Some(previous) if next.same_observable(previous) => Reconciliation::Unchanged,
        previous => {
            next.revision = previous.map_or(0, |view| view.revision) + 1;
            Reconciliation::Applied(Arc::new(next))
        }
    }
}

fn next_station_index(stations: &BTreeMap<MachineId, StationSnapshot>) -> u32 {
    stations
        .values()
        .map(|station| station.station_index)
        .max()
        .unwrap_or(0)
        + 1
}

fn new_station(id: MachineId, index: u32, parent: MachineId) -> StationSnapshot {
    let mut snapshot = MachineSnapshot::empty(id);
    snapshot.parent_id = Some(parent);
    StationSnapshot::new(index, snapshot)
}

/// Stations are merged one by one against their existing entry. Stations missing
/// from the list are retained, and an empty list never clears a populated map.
fn merge_stations(
    view: &mut MachineView,
    stations: &[StationPatch],
    event: &CanonicalEvent,
    now: DateTime<Utc>,
    settings: &ReconcileSettings,
) {
    let machine_id = view.machine.id;

    if stations.is_empty() {
        if !view.stations.is_empty() {
            tracing::warn!(
                machine_id = %machine_id,
                multi_station = view.machine.is_multi_station,
                retained = view.stations.len(),
                kind = event.kind.as_str(),
                "Discarding empty station list for populated machine"
            );
        }
        return;
    }

    let replace = event.origin == EventOrigin::Resync && event.kind == EventKind::FullContext;
    let mut merged = if replace {
        BTreeMap::new()
    } else {
        view.stations.clone()
    };
    let touches = event.kind.touches();

    // Positions only number stations when the list is the full grid.
    let full_list = event.kind == EventKind::FullContext;

    for entry in stations {
        if entry.id == machine_id {
            tracing::warn!(machine_id = %machine_id, "Ignoring station entry that repeats the machine id");
            continue;
        }
        let existing = view.stations.get(&entry.id);
        let index = match (entry.index, existing) {
            (Some(index), _) => index,
            (None, _) if full_list => entry.position,
            (None, Some(existing)) => existing.station_index,
            (None, None) => next_station_index(&merged),
        };
        let mut station = existing
            .cloned()
            .unwrap_or_else(|| new_station(entry.id, index, machine_id));
        station.station_index = index;
        merge_snapshot(&mut station.snapshot, &entry.patch, event.kind, touches, now, settings);
        merged.insert(entry.id, station);
    }

    if replace && merged.is_empty() {
        tracing::warn!(
            machine_id = %machine_id,
            retained = view.stations.len(),
            "Resync carried no usable station, keeping station map"
        );
        return;
    }

    if replace && merged.len() < view.stations.len() {
        tracing::info!(
            machine_id = %machine_id,
            before = view.stations.len(),
            after = merged.len(),
            "Resync replaced station map"
        );
    }
    view.stations = merged;
}

fn merge_snapshot(
    snapshot: &mut MachineSnapshot,
    patch: &MachinePatch,
    kind: EventKind,
    touches: TouchSet,
    now: DateTime<Utc>,
    settings: &ReconcileSettings,
) {
    let before = snapshot.clone();
    let fresh = snapshot
        .last_updated_at
        .is_some_and(|at| now - at < settings.freshness_window);

    if touches.identity {
        if let Some(name) = &patch.name {
            snapshot.name = name.clone();
        }
        match &patch.parent_id {
            Field::Absent => {}
            Field::Null => snapshot.parent_id = None,
            Field::Value(parent) => snapshot.parent_id = Some(*parent),
        }
        if let Some(multi) = patch.is_multi_station {
            snapshot.is_multi_station = multi;
        }
    }

    if touches.counters {
        let id = snapshot.id;
        merge_record(&mut snapshot.operator_session, &patch.operator_session, fresh, id, "operator_session");
        merge_record(&mut snapshot.shift_production, &patch.shift_production, fresh, id, "shift_production");
        merge_record(&mut snapshot.map_production, &patch.map_production, fresh, id, "map_production");
    }

    if touches.reject_quantity && !patch.has_counter_records() {
        if let Some(quantity) = patch.reject_quantity {
            add_rejects(snapshot, quantity);
        }
    }

    let stopped_now = match touches.stop {
        StopEffect::Untouched => false,
        StopEffect::FromPayload => match &patch.active_stop {
            Field::Absent => false,
            Field::Null => {
                clear_stop(snapshot, patch, touches, now);
                false
            }
            Field::Value(stop) => {
                set_stop(snapshot, stop, now);
                true
            }
        },
        StopEffect::Set => {
            let stop = patch.active_stop.as_value().cloned().unwrap_or_default();
            set_stop(snapshot, &stop, now);
            true
        }
        StopEffect::Clear => {
            clear_stop(snapshot, patch, touches, now);
            false
        }
    };

    if touches.last_stop {
        match &patch.last_stop {
            Field::Absent => {}
            Field::Null => snapshot.last_stop = None,
            Field::Value(last) => snapshot.last_stop = Some(merge_last_stop(snapshot.last_stop.as_ref(), last)),
        }
    }

    if touches.justification {
        if let Some(justification) = &patch.justification {
            let mut matched = false;
            if let Some(stop) = snapshot
                .active_stop
                .as_mut()
                .filter(|stop| stop.id == Some(justification.stop_id))
            {
                stop.reason_id = Some(justification.reason_id);
                matched = true;
            }
            if let Some(last) = snapshot
                .last_stop
                .as_mut()
                .filter(|last| last.id == Some(justification.stop_id))
            {
                last.reason_id = Some(justification.reason_id);
                last.justified = true;
                matched = true;
            }
            if !matched {
                tracing::debug!(
                    machine_id = %snapshot.id,
                    stop_id = justification.stop_id,
                    "Justification does not match a known stop"
                );
            }
        }
    }

    if stopped_now {
        snapshot.speed = patch.speed.unwrap_or(0.0);
    } else if touches.speed {
        if let Some(speed) = patch.speed {
            if snapshot.active_stop.is_none() {
                snapshot.speed = speed;
            } else if speed != snapshot.speed {
                tracing::debug!(
                    machine_id = %snapshot.id,
                    speed,
                    kind = kind.as_str(),
                    "Ignoring speed while machine is stopped"
                );
            }
        }
    }

    snapshot.is_running = snapshot.active_stop.is_none();

    if !snapshot.same_observable(&before) {
        snapshot.last_updated_at = Some(now);
    }
}

/// Apply an incoming counter record, keeping the previous counters when the
/// incoming ones look like a regression inside the same scope. All-zero
/// counters only count as a regression inside the freshness window.
fn merge_record<R>(
    slot: &mut Option<R>,
    incoming: &Field<R>,
    fresh: bool,
    machine_id: MachineId,
    record: &'static str,
) where
    R: CounterRecord,
{
    let incoming = match incoming {
        Field::Absent => return,
        Field::Null => {
            *slot = None;
            return;
        }
        Field::Value(incoming) => incoming,
    };

    let mut next = incoming.clone();
    if let Some(previous) = slot.as_ref() {
        let scope_changed = next.scope_id().is_some() && next.scope_id() != previous.scope_id();
        // A zeroed record is trusted once the window has passed; a partial
        // decrease inside one scope never is.
        let regressed = if next.counters().is_zero() {
            fresh
        } else {
            next.counters().decreases_from(previous.counters())
        };
        if !scope_changed && !previous.counters().is_zero() && regressed {
            tracing::warn!(
                machine_id = %machine_id,
                record,
                fresh,
                previous_valid = previous.counters().valid_signal_count,
                incoming_valid = next.counters().valid_signal_count,
                "Rejecting counter regression"
            );
            *next.counters_mut() = previous.counters().clone();
        }
    }
    *slot = Some(next);
}

fn add_rejects(snapshot: &mut MachineSnapshot, quantity: u64) {
    let mut applied = false;
    if let Some(session) = snapshot.operator_session.as_mut() {
        let counters = session.counters_mut();
        counters.reject_count = counters.reject_count.saturating_add(quantity);
        applied = true;
    }
    if let Some(shift) = snapshot.shift_production.as_mut() {
        let counters = shift.counters_mut();
        counters.reject_count = counters.reject_count.saturating_add(quantity);
        applied = true;
    }
    if let Some(map) = snapshot.map_production.as_mut() {
        let counters = map.counters_mut();
        counters.reject_count = counters.reject_count.saturating_add(quantity);
        applied = true;
    }
    if !applied {
        tracing::debug!(machine_id = %snapshot.id, quantity, "No counter record to add rejects to");
    }
}

/// A re-sent stop with the same (or no) id keeps what is already known about it.
fn set_stop(snapshot: &mut MachineSnapshot, stop: &StopPatch, now: DateTime<Utc>) {
    let existing = snapshot
        .active_stop
        .as_ref()
        .filter(|current| stop.id.is_none() || current.id == stop.id);

    snapshot.active_stop = Some(ActiveStop {
        id: stop.id.or_else(|| existing.and_then(|current| current.id)),
        started_at_unix_seconds: stop
            .started_at_unix_seconds
            .or_else(|| existing.map(|current| current.started_at_unix_seconds))
            .unwrap_or_else(|| now.timestamp()),
        reason_id: stop
            .reason_id
            .or_else(|| existing.and_then(|current| current.reason_id)),
        blocks_signals: stop.blocks_signals,
    });
}

/// Ends the active stop. It becomes the last stop unless the event brings its own.
fn clear_stop(snapshot: &mut MachineSnapshot, patch: &MachinePatch, touches: TouchSet, now: DateTime<Utc>) {
    let Some(stop) = snapshot.active_stop.take() else {
        return;
    };
    if touches.last_stop && !patch.last_stop.is_absent() {
        return;
    }
    snapshot.last_stop = Some(LastStop {
        id: stop.id,
        started_at_unix_seconds: Some(stop.started_at_unix_seconds),
        ended_at_unix_seconds: Some(now.timestamp()),
        reason_id: stop.reason_id,
        justified: false,
    });
}

/// Fill gaps in an incoming last stop from the record it describes.
fn merge_last_stop(existing: Option<&LastStop>, incoming: &LastStop) -> LastStop {
    match existing.filter(|existing| incoming.id.is_none() || existing.id == incoming.id) {
        Some(existing) => LastStop {
            id: incoming.id.or(existing.id),
            started_at_unix_seconds: incoming
                .started_at_unix_seconds
                .or(existing.started_at_unix_seconds),
            ended_at_unix_seconds: incoming
                .ended_at_unix_seconds
                .or(existing.ended_at_unix_seconds),
            reason_id: incoming.reason_id.or(existing.reason_id),
            justified: incoming.justified || existing.justified,
        },
        None => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::normalizer::{normalize, Normalized};
    use crate::domain::event::RawEvent;
    use crate::domain::machine::Counters;
    use serde_json::{json, Value};

    fn id(raw: u64) -> MachineId {
        MachineId::new(raw).unwrap()
    }

    fn event_from(tracked: MachineId, tag: &str, payload: Value, origin: EventOrigin) -> CanonicalEvent {
        match normalize(&RawEvent::new(tag, payload, origin), tracked) {
            Ok(Normalized::Event(event)) => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    fn event(tag: &str, payload: Value) -> CanonicalEvent {
        event_from(id(1), tag, payload, EventOrigin::Stream)
    }

    fn apply(
        view: Option<&Arc<MachineView>>,
        event: &CanonicalEvent,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        reconcile(view, id(1), event, now, &ReconcileSettings::default())
    }

    fn applied(result: Reconciliation) -> Arc<MachineView> {
        match result {
            Reconciliation::Applied(view) => view,
            other => panic!("expected applied view, got {:?}", other),
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn press_context() -> Value {
        json!({
            "id": 1,
            "nome": "Press A",
            "multipostos": true,
            "velocidade": 12,
            "sessao_operador": {"id_sessao": 9, "sinais": 0, "sinais_validos": 0, "rejeitos": 0},
            "maquinas_filhas": [
                {"id": 101, "nome": "Post 1", "sessao_operador": {"id_sessao": 9, "sinais": 50, "sinais_validos": 50}},
                {"id": 102, "nome": "Post 2", "sessao_operador": {"id_sessao": 9, "sinais": 30, "sinais_validos": 30}}
            ]
        })
    }

    fn valid_signals(view: &MachineView, station: u64) -> u64 {
        view.station(id(station))
            .and_then(|s| s.snapshot.operator_session.as_ref())
            .map(|session| session.counters.valid_signal_count)
            .unwrap_or_default()
    }

    fn assert_stop_run_exclusive(view: &MachineView) {
        assert_eq!(view.machine.is_running, view.machine.active_stop.is_none());
        for station in view.stations.values() {
            assert_eq!(station.snapshot.is_running, station.snapshot.active_stop.is_none());
        }
    }

    #[test]
    fn test_signal_before_context_stays_uninitialized() {
        let signal = event("sinal", json!({"sessao_operador": {"sinais": 5, "sinais_validos": 5}}));
        assert_eq!(
            apply(None, &signal, t0()),
            Reconciliation::Rejected(RejectReason::Uninitialized("signal"))
        );
    }

    #[test]
    fn test_empty_context_does_not_initialize() {
        let empty = event("full_context", json!({}));
        assert_eq!(
            apply(None, &empty, t0()),
            Reconciliation::Rejected(RejectReason::EmptyInitialization)
        );
    }

    #[test]
    fn test_context_for_other_machine_does_not_initialize() {
        let other = event("full_context", json!({"id": 7, "nome": "Other"}));
        assert_eq!(
            apply(None, &other, t0()),
            Reconciliation::Rejected(RejectReason::UnknownTarget(id(7)))
        );
    }

    #[test]
    fn test_station_regression_rejected_within_window() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        assert_eq!(view.revision, 1);
        assert_eq!(view.machine.name, "Press A");
        assert_eq!(valid_signals(&view, 101), 50);
        assert_eq!(valid_signals(&view, 102), 30);

        let update = event(
            "context_update",
            json!({
                "id": 1,
                "maquinas_filhas": [
                    {"id": 101, "sessao_operador": {"id_sessao": 9, "sinais": 0, "sinais_validos": 0, "rejeitos": 0}},
                    {"id": 102, "sessao_operador": {"id_sessao": 9, "sinais": 31, "sinais_validos": 31}}
                ]
            }),
        );
        let view = applied(apply(Some(&view), &update, t0() + Duration::seconds(30)));
        assert_eq!(valid_signals(&view, 101), 50);
        assert_eq!(valid_signals(&view, 102), 31);
        assert_eq!(view.revision, 2);
    }

    #[test]
    fn test_zero_counters_accepted_after_window() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let update = event(
            "context_update",
            json!({"maquinas_filhas": [{"id": 101, "sessao_operador": {"id_sessao": 9, "sinais": 0, "sinais_validos": 0}}]}),
        );
        let view = applied(apply(Some(&view), &update, t0() + Duration::seconds(121)));
        assert_eq!(valid_signals(&view, 101), 0);
    }

    #[test]
    fn test_new_session_scope_resets_counters() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let update = event(
            "context_update",
            json!({"maquinas_filhas": [{"id": 101, "sessao_operador": {"id_sessao": 10, "sinais": 0, "sinais_validos": 0}}]}),
        );
        let view = applied(apply(Some(&view), &update, t0() + Duration::seconds(5)));
        let session = view.station(id(101)).unwrap().snapshot.operator_session.clone().unwrap();
        assert_eq!(session.session_id, Some(10));
        assert!(session.counters.is_zero());
    }

    #[test]
    fn test_forced_stop_then_signal() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        assert!(view.machine.is_running);
        assert_eq!(view.machine.speed, 12.0);

        let stop = event("parada_forcada", json!({"id_maquina": 1, "id_motivo": 7}));
        let view = applied(apply(Some(&view), &stop, t0() + Duration::seconds(10)));
        assert!(!view.machine.is_running);
        assert_eq!(view.machine.speed, 0.0);
        let active = view.machine.active_stop.clone().unwrap();
        assert_eq!(active.reason_id, Some(7));
        assert_eq!(active.started_at_unix_seconds, t0().timestamp() + 10);
        assert_stop_run_exclusive(&view);

        let signal = event("sinal", json!({"id_maquina": 1}));
        let view = applied(apply(Some(&view), &signal, t0() + Duration::seconds(20)));
        assert!(view.machine.is_running);
        assert!(view.machine.active_stop.is_none());
        let last = view.machine.last_stop.clone().unwrap();
        assert_eq!(last.reason_id, Some(7));
        assert_eq!(last.ended_at_unix_seconds, Some(t0().timestamp() + 20));
        assert_stop_run_exclusive(&view);
    }

    #[test]
    fn test_identical_context_is_unchanged() {
        let context = event("full_context", press_context());
        let view = applied(apply(None, &context, t0()));
        assert_eq!(
            apply(Some(&view), &context, t0() + Duration::seconds(3)),
            Reconciliation::Unchanged
        );
    }

    #[test]
    fn test_empty_station_list_is_discarded() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let empty = event(
            "full_context",
            json!({"id": 1, "nome": "Press A", "multipostos": true, "velocidade": 12, "maquinas_filhas": []}),
        );
        assert_eq!(apply(Some(&view), &empty, t0() + Duration::seconds(1)), Reconciliation::Unchanged);

        let legacy_empty = event(
            "full_context",
            json!({"id_maquina": 1, "nome": "Press B", "contextos_filhas": []}),
        );
        let next = applied(apply(Some(&view), &legacy_empty, t0() + Duration::seconds(1)));
        assert_eq!(next.machine.name, "Press B");
        assert_eq!(next.stations.len(), 2);
    }

    #[test]
    fn test_missing_stations_are_retained() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let partial = event(
            "context_update",
            json!({"maquinas_filhas": [{"id": 103, "nome": "Post 3"}]}),
        );
        let view = applied(apply(Some(&view), &partial, t0() + Duration::seconds(1)));
        assert_eq!(view.stations.len(), 3);
        assert_eq!(view.station(id(101)).unwrap().station_index, 1);
        assert_eq!(view.station(id(102)).unwrap().station_index, 2);
        assert_eq!(view.station(id(103)).unwrap().station_index, 3);
        assert_eq!(view.station(id(103)).unwrap().snapshot.parent_id, Some(id(1)));
    }

    #[test]
    fn test_partial_list_keeps_station_indexes() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let partial = event(
            "context_update",
            json!({"maquinas_filhas": [{"id": 102, "nome": "Post 2b"}]}),
        );
        let view = applied(apply(Some(&view), &partial, t0() + Duration::seconds(1)));
        let indexes: Vec<_> = view
            .stations
            .iter()
            .map(|(id, station)| (id.get(), station.station_index))
            .collect();
        assert_eq!(indexes, vec![(101, 1), (102, 2)]);
        assert_eq!(view.station(id(102)).unwrap().snapshot.name, "Post 2b");

        let explicit = event(
            "context_update",
            json!({"maquinas_filhas": [{"id": 102, "index": 5}]}),
        );
        let view = applied(apply(Some(&view), &explicit, t0() + Duration::seconds(2)));
        assert_eq!(view.station(id(102)).unwrap().station_index, 5);
    }

    #[test]
    fn test_partial_decrease_rejected_after_window() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let stale = event(
            "context_update",
            json!({"maquinas_filhas": [{"id": 101, "sessao_operador": {"id_sessao": 9, "sinais": 50, "sinais_validos": 45}}]}),
        );
        let result = apply(Some(&view), &stale, t0() + Duration::seconds(180));
        assert_eq!(result, Reconciliation::Unchanged);
        assert_eq!(valid_signals(&view, 101), 50);
    }

    #[test]
    fn test_resync_replaces_station_map() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let resync = event_from(
            id(1),
            "full_context",
            json!({"id": 1, "maquinas_filhas": [{"id": 102, "sessao_operador": {"id_sessao": 9, "sinais": 30, "sinais_validos": 30}}]}),
            EventOrigin::Resync,
        );
        let view = applied(apply(Some(&view), &resync, t0() + Duration::seconds(1)));
        assert_eq!(view.stations.keys().copied().collect::<Vec<_>>(), vec![id(102)]);
    }

    #[test]
    fn test_resync_listing_only_machine_keeps_stations() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let resync = event_from(
            id(1),
            "full_context",
            json!({"id": 1, "multipostos": true, "maquinas_filhas": [{"id": 1}]}),
            EventOrigin::Resync,
        );
        let result = apply(Some(&view), &resync, t0() + Duration::seconds(1));
        let stations = match result {
            Reconciliation::Applied(next) => next.stations.clone(),
            Reconciliation::Unchanged => view.stations.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(stations.keys().copied().collect::<Vec<_>>(), vec![id(101), id(102)]);
    }

    #[test]
    fn test_huge_freshness_window_is_clamped() {
        let settings = ReconcileSettings::from_secs(100_000_000_000_000_000);
        assert_eq!(settings.freshness_window, Duration::seconds(i64::MAX / 1000));
        assert_eq!(ReconcileSettings::from_secs(u64::MAX), settings);
    }

    #[test]
    fn test_invalid_station_ids_never_become_keys() {
        let context = event(
            "full_context",
            json!({"id": 1, "maquinas_filhas": [{"id": 0}, {"id": "abc"}, {"nome": "no id"}, {"id": 104}]}),
        );
        let view = applied(apply(None, &context, t0()));
        assert_eq!(view.stations.keys().copied().collect::<Vec<_>>(), vec![id(104)]);
    }

    #[test]
    fn test_partial_event_for_unknown_station_rejected() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let signal = event("sinal", json!({"id_maquina": 1, "from_child": 999}));
        assert_eq!(
            apply(Some(&view), &signal, t0()),
            Reconciliation::Rejected(RejectReason::UnknownTarget(id(999)))
        );
    }

    #[test]
    fn test_station_context_with_parent_adds_station() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let update = event("context_update", json!({"id": 105, "nome": "Post 5", "maquina_pai": 1}));
        let view = applied(apply(Some(&view), &update, t0()));
        assert_eq!(view.station(id(105)).unwrap().snapshot.name, "Post 5");
        assert_eq!(view.station(id(105)).unwrap().station_index, 3);
    }

    #[test]
    fn test_speed_event_touches_only_speed() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let speed = event(
            "velocidade",
            json!({"id_maquina": 1, "velocidade": 20, "nome": "Renamed",
                "sessao_operador": {"id_sessao": 9, "sinais": 99, "sinais_validos": 99}}),
        );
        let view = applied(apply(Some(&view), &speed, t0() + Duration::seconds(1)));
        assert_eq!(view.machine.speed, 20.0);
        assert_eq!(view.machine.name, "Press A");
        assert_eq!(
            view.machine.operator_session.as_ref().unwrap().counters,
            Counters::default()
        );
    }

    #[test]
    fn test_speed_ignored_while_stopped() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let view = applied(apply(Some(&view), &event("parada", json!({"id_parada": 4})), t0()));
        let speed = event("velocidade", json!({"velocidade": 15}));
        assert_eq!(apply(Some(&view), &speed, t0()), Reconciliation::Unchanged);
    }

    #[test]
    fn test_resent_stop_keeps_start_time() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let stop = event("parada", json!({"id_parada": 4, "inicio": 1_699_999_990}));
        let view = applied(apply(Some(&view), &stop, t0()));
        let again = event("parada", json!({"id_parada": 4}));
        assert_eq!(apply(Some(&view), &again, t0() + Duration::seconds(30)), Reconciliation::Unchanged);
    }

    #[test]
    fn test_justification_marks_last_stop() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let view = applied(apply(Some(&view), &event("parada", json!({"id_parada": 4})), t0()));
        let view = applied(apply(Some(&view), &event("retomada", json!({})), t0() + Duration::seconds(60)));
        let justified = event("parada_justificada", json!({"id_parada": 4, "id_motivo": 12}));
        let view = applied(apply(Some(&view), &justified, t0() + Duration::seconds(70)));
        let last = view.machine.last_stop.clone().unwrap();
        assert!(last.justified);
        assert_eq!(last.reason_id, Some(12));
    }

    #[test]
    fn test_rejects_added_increments_counts() {
        let view = applied(apply(None, &event("full_context", press_context()), t0()));
        let rejects = event("rejeitos_adicionados", json!({"id_maquina": 1, "from_child": 102, "quantidade": 3}));
        let view = applied(apply(Some(&view), &rejects, t0()));
        let session = view.station(id(102)).unwrap().snapshot.operator_session.clone().unwrap();
        assert_eq!(session.counters.reject_count, 3);
        assert_eq!(session.counters.valid_signal_count, 30);
    }

    #[test]
    fn test_context_with_active_stop_and_speed() {
        let context = event(
            "full_context",
            json!({"id": 1, "nome": "Press A", "velocidade": 9,
                "parada_ativa": {"id": 3, "inicio": 1_699_999_000, "motivo_id": 2}}),
        );
        let view = applied(apply(None, &context, t0()));
        assert!(!view.machine.is_running);
        assert_eq!(view.machine.speed, 9.0);

        let cleared = event("full_context", json!({"id": 1, "parada_ativa": null}));
        let view = applied(apply(Some(&view), &cleared, t0()));
        assert!(view.machine.is_running);
        assert_eq!(view.machine.last_stop.as_ref().and_then(|s| s.id), Some(3));
        assert_stop_run_exclusive(&view);
    }

    #[test]
    fn test_out_of_order_sequence_keeps_exclusion() {
        let mut view = applied(apply(None, &event("full_context", press_context()), t0()));
        let sequence = [
            event("sinal", json!({"from_child": 101})),
            event("parada", json!({"from_child": 101, "id_parada": 1})),
            event("retomada_forcada", json!({"from_child": 102})),
            event("parada_forcada", json!({"id_motivo": 3})),
            event("velocidade", json!({"velocidade": 40})),
            event("sinal", json!({})),
            event("parada", json!({"from_child": 102})),
        ];
        for (offset, next) in sequence.iter().enumerate() {
            if let Reconciliation::Applied(updated) =
                apply(Some(&view), next, t0() + Duration::seconds(offset as i64))
            {
                view = updated;
            }
            assert_stop_run_exclusive(&view);
        }
        assert!(view.machine.is_running);
        assert!(!view.station(id(102)).unwrap().snapshot.is_running);
    }
}
