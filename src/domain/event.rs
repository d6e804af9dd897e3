// Canonical machine events produced by the normalizer
use super::machine::{LastStop, MachineId, MapProduction, SessionProduction, ShiftProduction};
use serde::Serialize;
use serde_json::Value;

/// Where an event entered the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Stream,
    Command,
    /// Operator-requested full resync.
    Resync,
}

/// A raw event as received, before normalization.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub tag: String,
    pub payload: Value,
    pub origin: EventOrigin,
}

impl RawEvent {
    pub fn new(tag: impl Into<String>, payload: Value, origin: EventOrigin) -> Self {
        Self {
            tag: tag.into(),
            payload,
            origin,
        }
    }

    /// Build from a stream message, reading the `type` discriminator.
    pub fn from_stream(payload: Value) -> Self {
        let tag = payload
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        Self::new(tag, payload, EventOrigin::Stream)
    }

    pub fn full_context(payload: Value, origin: EventOrigin) -> Self {
        Self::new("full_context", payload, origin)
    }

    pub fn command_response(payload: Value) -> Self {
        Self::new("command_response", payload, EventOrigin::Command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FullContext,
    ContextUpdate,
    CommandResponse,
    Signal,
    Stop { forced: bool },
    Resume { forced: bool },
    StopJustified,
    Speed,
    RejectsAdded,
    ProductionStarted,
}

/// What an event kind does to the active stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEffect {
    Untouched,
    /// Follow `parada_ativa` from the payload when present.
    FromPayload,
    Set,
    Clear,
}

/// Sub-records an event kind is allowed to modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchSet {
    pub identity: bool,
    pub speed: bool,
    pub stop: StopEffect,
    pub last_stop: bool,
    pub counters: bool,
    pub justification: bool,
    pub reject_quantity: bool,
}

impl TouchSet {
    const NONE: TouchSet = TouchSet {
        identity: false,
        speed: false,
        stop: StopEffect::Untouched,
        last_stop: false,
        counters: false,
        justification: false,
        reject_quantity: false,
    };
}

impl EventKind {
    pub fn touches(&self) -> TouchSet {
        match self {
            EventKind::FullContext | EventKind::ContextUpdate | EventKind::CommandResponse => {
                TouchSet {
                    identity: true,
                    speed: true,
                    stop: StopEffect::FromPayload,
                    last_stop: true,
                    counters: true,
                    ..TouchSet::NONE
                }
            }
            EventKind::Signal => TouchSet {
                speed: true,
                stop: StopEffect::Clear,
                counters: true,
                ..TouchSet::NONE
            },
            EventKind::Stop { .. } => TouchSet {
                speed: true,
                stop: StopEffect::Set,
                ..TouchSet::NONE
            },
            EventKind::Resume { .. } => TouchSet {
                speed: true,
                stop: StopEffect::Clear,
                last_stop: true,
                ..TouchSet::NONE
            },
            EventKind::StopJustified => TouchSet {
                justification: true,
                ..TouchSet::NONE
            },
            EventKind::Speed => TouchSet {
                speed: true,
                ..TouchSet::NONE
            },
            EventKind::RejectsAdded => TouchSet {
                counters: true,
                reject_quantity: true,
                ..TouchSet::NONE
            },
            EventKind::ProductionStarted => TouchSet {
                counters: true,
                ..TouchSet::NONE
            },
        }
    }

    /// Kinds that may populate an uninitialized view.
    pub fn may_initialize(&self) -> bool {
        matches!(self, EventKind::FullContext | EventKind::CommandResponse)
    }

    /// Kinds whose station list may introduce stations not seen before.
    pub fn may_add_stations(&self) -> bool {
        matches!(
            self,
            EventKind::FullContext | EventKind::ContextUpdate | EventKind::CommandResponse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FullContext => "full_context",
            EventKind::ContextUpdate => "context_update",
            EventKind::CommandResponse => "command_response",
            EventKind::Signal => "signal",
            EventKind::Stop { forced: false } => "stop",
            EventKind::Stop { forced: true } => "forced_stop",
            EventKind::Resume { forced: false } => "resume",
            EventKind::Resume { forced: true } => "forced_resume",
            EventKind::StopJustified => "stop_justified",
            EventKind::Speed => "speed",
            EventKind::RejectsAdded => "rejects_added",
            EventKind::ProductionStarted => "production_started",
        }
    }
}

/// A payload field that distinguishes "not sent" from an explicit null.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Field<T> {
    #[default]
    Absent,
    Null,
    Value(T),
}

impl<T> Field<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Field::Absent)
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Keep `self` unless `other` carries something.
    pub fn or_overlay(self, other: Field<T>) -> Field<T> {
        if other.is_absent() { self } else { other }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopPatch {
    pub id: Option<i64>,
    pub started_at_unix_seconds: Option<i64>,
    pub reason_id: Option<i64>,
    pub blocks_signals: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopJustification {
    pub stop_id: i64,
    pub reason_id: i64,
}

/// Fields extracted from one payload. Absent fields leave the snapshot untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachinePatch {
    pub name: Option<String>,
    pub parent_id: Field<MachineId>,
    pub is_multi_station: Option<bool>,
    pub speed: Option<f64>,
    pub active_stop: Field<StopPatch>,
    pub last_stop: Field<LastStop>,
    pub operator_session: Field<SessionProduction>,
    pub shift_production: Field<ShiftProduction>,
    pub map_production: Field<MapProduction>,
    pub reject_quantity: Option<u64>,
    pub justification: Option<StopJustification>,
}

impl MachinePatch {
    pub fn is_empty(&self) -> bool {
        *self == MachinePatch::default()
    }

    pub fn has_counter_records(&self) -> bool {
        !self.operator_session.is_absent()
            || !self.shift_production.is_absent()
            || !self.map_production.is_absent()
    }

    /// Layer `other` on top of `self`, field by field.
    pub fn overlay(self, other: MachinePatch) -> MachinePatch {
        MachinePatch {
            name: other.name.or(self.name),
            parent_id: self.parent_id.or_overlay(other.parent_id),
            is_multi_station: other.is_multi_station.or(self.is_multi_station),
            speed: other.speed.or(self.speed),
            active_stop: self.active_stop.or_overlay(other.active_stop),
            last_stop: self.last_stop.or_overlay(other.last_stop),
            operator_session: self.operator_session.or_overlay(other.operator_session),
            shift_production: self.shift_production.or_overlay(other.shift_production),
            map_production: self.map_production.or_overlay(other.map_production),
            reject_quantity: other.reject_quantity.or(self.reject_quantity),
            justification: other.justification.or(self.justification),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationPatch {
    pub id: MachineId,
    /// Index sent by the backend, if any.
    pub index: Option<u32>,
    /// 1-based position in the payload list.
    pub position: u32,
    pub patch: MachinePatch,
}

/// One normalized event, independent of the payload generation it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub origin: EventOrigin,
    /// Machine or station the machine patch applies to.
    pub target: MachineId,
    pub machine: MachinePatch,
    /// Station list, when the payload carried one.
    pub stations: Option<Vec<StationPatch>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    GoalReached,
    NearGoal,
    Other(String),
}

/// Production goal notice. Never merged into a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionAlert {
    pub machine_id: MachineId,
    pub station_id: Option<MachineId>,
    pub kind: AlertKind,
    pub valid_signal_count: u64,
    pub quantity_to_produce: u64,
    pub percent: f64,
    pub remaining: Option<i64>,
    pub message: String,
}
