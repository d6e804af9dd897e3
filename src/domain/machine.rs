// Machine state domain models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Backend machine identifier. Always a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct MachineId(u64);

impl MachineId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Parse an id from a JSON value.
    /// Accepts integers, integral finite floats and decimal strings.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(raw) = n.as_u64() {
                    return Self::new(raw);
                }
                let raw = n.as_f64()?;
                if raw.is_finite() && raw.fract() == 0.0 && raw >= 1.0 && raw <= u64::MAX as f64 {
                    Self::new(raw as u64)
                } else {
                    None
                }
            }
            Value::String(s) => s.trim().parse::<u64>().ok().and_then(Self::new),
            _ => None,
        }
    }
}

impl TryFrom<u64> for MachineId {
    type Error = String;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| format!("machine id must be positive, got {}", raw))
    }
}

impl From<MachineId> for u64 {
    fn from(id: MachineId) -> Self {
        id.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Counters {
    pub signal_count: u64,
    pub valid_signal_count: u64,
    pub reject_count: u64,
}

impl Counters {
    pub fn new(signal_count: u64, valid_signal_count: u64, reject_count: u64) -> Self {
        Self {
            signal_count,
            valid_signal_count,
            reject_count,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.signal_count == 0 && self.valid_signal_count == 0 && self.reject_count == 0
    }

    /// True when any counter is lower than in `previous`.
    pub fn decreases_from(&self, previous: &Counters) -> bool {
        self.signal_count < previous.signal_count
            || self.valid_signal_count < previous.valid_signal_count
            || self.reject_count < previous.reject_count
    }
}

/// A sub-record carrying production counters scoped by some id
/// (session, shift or work order).
pub trait CounterRecord: Clone {
    fn scope_id(&self) -> Option<i64>;
    fn counters(&self) -> &Counters;
    fn counters_mut(&mut self) -> &mut Counters;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionProduction {
    pub session_id: Option<i64>,
    pub operator_id: Option<i64>,
    #[serde(flatten)]
    pub counters: Counters,
    pub elapsed_seconds: u64,
    pub stopped_seconds: u64,
    pub valid_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShiftProduction {
    pub shift_id: Option<i64>,
    #[serde(flatten)]
    pub counters: Counters,
    pub elapsed_seconds: u64,
    pub stopped_seconds: u64,
    pub valid_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MapProduction {
    pub map_id: Option<i64>,
    pub item_id: Option<i64>,
    pub product_ref: Option<i64>,
    pub color_ref: Option<i64>,
    pub mold_ref: Option<i64>,
    pub quantity_to_produce: u64,
    #[serde(flatten)]
    pub counters: Counters,
    pub remaining_to_produce: i64,
    pub started_at: Option<i64>,
}

impl CounterRecord for SessionProduction {
    fn scope_id(&self) -> Option<i64> {
        self.session_id
    }
    fn counters(&self) -> &Counters {
        &self.counters
    }
    fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }
}

impl CounterRecord for ShiftProduction {
    fn scope_id(&self) -> Option<i64> {
        self.shift_id
    }
    fn counters(&self) -> &Counters {
        &self.counters
    }
    fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }
}

impl CounterRecord for MapProduction {
    fn scope_id(&self) -> Option<i64> {
        self.map_id
    }
    fn counters(&self) -> &Counters {
        &self.counters
    }
    fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveStop {
    pub id: Option<i64>,
    pub started_at_unix_seconds: i64,
    pub reason_id: Option<i64>,
    pub blocks_signals: bool,
}

/// Most recent finished stop, kept for history display and justification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastStop {
    pub id: Option<i64>,
    pub started_at_unix_seconds: Option<i64>,
    pub ended_at_unix_seconds: Option<i64>,
    pub reason_id: Option<i64>,
    pub justified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSnapshot {
    pub id: MachineId,
    pub name: String,
    pub parent_id: Option<MachineId>,
    pub is_multi_station: bool,
    pub is_running: bool,
    pub speed: f64,
    pub active_stop: Option<ActiveStop>,
    pub last_stop: Option<LastStop>,
    pub operator_session: Option<SessionProduction>,
    pub shift_production: Option<ShiftProduction>,
    pub map_production: Option<MapProduction>,
    /// Client clock of the last accepted mutation. Never compared with server time.
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl MachineSnapshot {
    pub fn empty(id: MachineId) -> Self {
        Self {
            id,
            name: String::new(),
            parent_id: None,
            is_multi_station: false,
            is_running: true,
            speed: 0.0,
            active_stop: None,
            last_stop: None,
            operator_session: None,
            shift_production: None,
            map_production: None,
            last_updated_at: None,
        }
    }

    /// Compares everything a dashboard can show, ignoring bookkeeping timestamps.
    pub fn same_observable(&self, other: &MachineSnapshot) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.parent_id == other.parent_id
            && self.is_multi_station == other.is_multi_station
            && self.is_running == other.is_running
            && self.speed == other.speed
            && self.active_stop == other.active_stop
            && self.last_stop == other.last_stop
            && self.operator_session == other.operator_session
            && self.shift_production == other.shift_production
            && self.map_production == other.map_production
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationSnapshot {
    /// 1-based position of the station under its machine.
    pub station_index: u32,
    #[serde(flatten)]
    pub snapshot: MachineSnapshot,
}

impl StationSnapshot {
    pub fn new(station_index: u32, snapshot: MachineSnapshot) -> Self {
        Self {
            station_index,
            snapshot,
        }
    }
}

/// Reconciled view of one tracked machine and its stations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineView {
    pub machine: MachineSnapshot,
    pub stations: BTreeMap<MachineId, StationSnapshot>,
    pub revision: u64,
}

impl MachineView {
    pub fn new(machine: MachineSnapshot) -> Self {
        Self {
            machine,
            stations: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn station(&self, id: MachineId) -> Option<&StationSnapshot> {
        self.stations.get(&id)
    }

    pub fn same_observable(&self, other: &MachineView) -> bool {
        self.machine.same_observable(&other.machine)
            && self.stations.len() == other.stations.len()
            && self
                .stations
                .iter()
                .zip(other.stations.iter())
                .all(|((id_a, a), (id_b, b))| {
                    id_a == id_b
                        && a.station_index == b.station_index
                        && a.snapshot.same_observable(&b.snapshot)
                })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_machine_id_from_json() {
        assert_eq!(MachineId::from_json(&json!(101)), MachineId::new(101));
        assert_eq!(MachineId::from_json(&json!(101.0)), MachineId::new(101));
        assert_eq!(MachineId::from_json(&json!("42")), MachineId::new(42));

        assert_eq!(MachineId::from_json(&json!(0)), None);
        assert_eq!(MachineId::from_json(&json!(-3)), None);
        assert_eq!(MachineId::from_json(&json!(1.5)), None);
        assert_eq!(MachineId::from_json(&json!("abc")), None);
        assert_eq!(MachineId::from_json(&json!(null)), None);
    }

    #[test]
    fn test_machine_id_rejects_zero_on_deserialize() {
        assert!(serde_json::from_value::<MachineId>(json!(0)).is_err());
        assert_eq!(
            serde_json::from_value::<MachineId>(json!(7)).ok(),
            MachineId::new(7)
        );
    }

    #[test]
    fn test_counters_decrease() {
        let previous = Counters::new(10, 9, 1);
        assert!(Counters::new(10, 8, 1).decreases_from(&previous));
        assert!(!Counters::new(11, 9, 2).decreases_from(&previous));
        assert!(Counters::default().is_zero());
    }

    #[test]
    fn test_same_observable_ignores_timestamp() {
        let id = MachineId::new(1).unwrap();
        let a = MachineSnapshot::empty(id);
        let mut b = a.clone();
        b.last_updated_at = Some(Utc::now());
        assert!(a.same_observable(&b));

        b.speed = 12.0;
        assert!(!a.same_observable(&b));
    }
}
