// Payload normalizer - Maps both backend payload generations onto canonical events
use crate::domain::event::{
    AlertKind, CanonicalEvent, EventKind, EventOrigin, Field, MachinePatch, ProductionAlert,
    RawEvent, StationPatch, StopJustification, StopPatch,
};
use crate::domain::machine::{
    Counters, LastStop, MachineId, MapProduction, SessionProduction, ShiftProduction,
};
use chrono::DateTime;
use serde_json::{Map, Value};
use thiserror::Error;

type Object = Map<String, Value>;

/// Keys that may wrap the machine body of a payload, in lookup order.
const MACHINE_BODY_KEYS: [&str; 3] = ["dados_maquina", "machine_data", "data"];
const CONTEXT_BODY_KEYS: [&str; 4] = ["initial_context", "dados_maquina", "machine_data", "data"];
/// Keys naming the station a partial event belongs to.
const STATION_TARGET_KEYS: [&str; 3] = ["from_child", "id_maquina_filha", "id_estacao"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("payload of '{tag}' event is not a JSON object")]
    NotAnObject { tag: String },
    #[error("invalid machine id in '{field}': {value}")]
    InvalidId { field: &'static str, value: String },
    #[error("'{field}' is not a non-negative number: {value}")]
    MalformedCounter { field: &'static str, value: String },
    #[error("'{tag}' event is missing '{field}'")]
    MissingField { tag: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Event(CanonicalEvent),
    Alert(ProductionAlert),
    Ignored(&'static str),
}

/// Normalize one raw event for the machine the stream is subscribed to.
/// Ids missing from the payload are inferred from `subscribed`.
pub fn normalize(raw: &RawEvent, subscribed: MachineId) -> Result<Normalized, NormalizeError> {
    let tag = raw.tag.as_str();
    let payload = raw
        .payload
        .as_object()
        .ok_or_else(|| NormalizeError::NotAnObject {
            tag: tag.to_string(),
        })?;

    let event = match tag {
        "heartbeat" => return Ok(Normalized::Ignored("heartbeat")),
        "connected" => match nested(payload, "initial_context") {
            Some(context) => {
                normalize_context(context, EventKind::FullContext, raw.origin, subscribed)?
            }
            None => return Ok(Normalized::Ignored("connection acknowledgement")),
        },
        "full_context" => normalize_context(
            context_body(payload),
            EventKind::FullContext,
            raw.origin,
            subscribed,
        )?,
        "command_response" => normalize_context(
            context_body(payload),
            EventKind::CommandResponse,
            raw.origin,
            subscribed,
        )?,
        "context_update" | "machine_data" | "update" => normalize_context(
            context_body(payload),
            EventKind::ContextUpdate,
            raw.origin,
            subscribed,
        )?,
        "machine_update" => normalize_machine_update(payload, raw.origin, subscribed)?,
        "production_alert" => {
            return normalize_alert(payload, subscribed).map(Normalized::Alert);
        }
        other => match partial_kind(other) {
            Some(kind) => normalize_partial(payload, kind, raw.origin, subscribed, other)?,
            None => {
                tracing::warn!(tag = other, machine_id = %subscribed, "Ignoring unknown event type");
                return Ok(Normalized::Ignored("unknown event type"));
            }
        },
    };

    Ok(Normalized::Event(event))
}

fn partial_kind(tag: &str) -> Option<EventKind> {
    let kind = match tag {
        "sinal" => EventKind::Signal,
        "parada" | "stop" => EventKind::Stop { forced: false },
        "parada_forcada" | "forced_stop" => EventKind::Stop { forced: true },
        "retomada" | "resume" => EventKind::Resume { forced: false },
        "retomada_forcada" | "forced_resume" => EventKind::Resume { forced: true },
        "parada_justificada" => EventKind::StopJustified,
        "velocidade" => EventKind::Speed,
        "rejeitos_adicionados" => EventKind::RejectsAdded,
        "producao_iniciada" => EventKind::ProductionStarted,
        _ => return None,
    };
    Some(kind)
}

/// Full or full-ish context in either payload generation.
fn normalize_context(
    body: &Object,
    kind: EventKind,
    origin: EventOrigin,
    subscribed: MachineId,
) -> Result<CanonicalEvent, NormalizeError> {
    let own_context = nested(body, "contexto");
    let legacy = body.contains_key("contextos_filhas") || own_context.is_some();

    let mut machine = parse_patch(body)?;
    let stations = if legacy {
        if let Some(own) = own_context {
            machine = machine.overlay(parse_patch(own)?);
        }
        station_list(body.get("contextos_filhas"), true)?
    } else {
        station_list(body.get("maquinas_filhas"), false)?
    };

    let target = match optional_id(body, &["id_maquina", "id"])? {
        Some(id) => id,
        None => match own_context {
            Some(own) => optional_id(own, &["id", "id_maquina"])?.unwrap_or(subscribed),
            None => subscribed,
        },
    };

    if machine.is_multi_station.is_none() && stations.as_ref().is_some_and(|s| !s.is_empty()) {
        machine.is_multi_station = Some(true);
    }

    Ok(CanonicalEvent {
        kind,
        origin,
        target,
        machine,
        stations,
    })
}

/// Build the station list. Entries without a valid id are dropped here and never
/// reach the reconciler.
fn station_list(
    entries: Option<&Value>,
    legacy: bool,
) -> Result<Option<Vec<StationPatch>>, NormalizeError> {
    let entries = match entries {
        Some(Value::Array(entries)) => entries,
        Some(Value::Null) | None => return Ok(None),
        Some(other) => {
            tracing::warn!(value = %other, "Ignoring station list that is not an array");
            return Ok(None);
        }
    };

    let mut stations = Vec::with_capacity(entries.len());
    for (position, entry) in entries.iter().enumerate() {
        let Some(entry) = entry.as_object() else {
            tracing::warn!(position, "Dropping station entry that is not an object");
            continue;
        };

        let body = if legacy {
            match nested(entry, "contexto") {
                Some(context) => context,
                None => {
                    tracing::warn!(position, "Dropping legacy station entry without context");
                    continue;
                }
            }
        } else {
            entry
        };

        let raw_id = first_present(&[entry, body], &["id_maquina", "id"]);
        let Some(id) = raw_id.and_then(MachineId::from_json) else {
            tracing::warn!(
                position,
                raw_id = ?raw_id,
                "Dropping station entry with missing or invalid id"
            );
            continue;
        };

        let index = first_present(&[body, entry], &["index"])
            .and_then(Value::as_u64)
            .filter(|index| *index > 0)
            .and_then(|index| u32::try_from(index).ok());

        stations.push(StationPatch {
            id,
            index,
            position: position as u32 + 1,
            patch: parse_patch(body)?,
        });
    }

    Ok(Some(stations))
}

/// `machine_update` events of the current backend generation.
fn normalize_machine_update(
    payload: &Object,
    origin: EventOrigin,
    subscribed: MachineId,
) -> Result<CanonicalEvent, NormalizeError> {
    let kind = match payload.get("update_type").and_then(Value::as_str) {
        Some("sinal") => EventKind::Signal,
        Some("parada") => EventKind::Stop { forced: false },
        Some("parada_forcada") => EventKind::Stop { forced: true },
        Some("retomada") => EventKind::Resume { forced: false },
        Some("retomada_forcada") => EventKind::Resume { forced: true },
        Some("velocidade") => EventKind::Speed,
        _ => EventKind::ContextUpdate,
    };
    let body = machine_body(payload);

    let owner = optional_id(payload, &["target_machine_id"])?.unwrap_or(subscribed);
    let source = optional_id(payload, &["source_machine_id"])?;
    let is_child = payload
        .get("is_child_update")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || source.is_some_and(|source| source != owner);

    if kind == EventKind::ContextUpdate && !is_child {
        return normalize_context(body, kind, origin, subscribed);
    }

    let target = if owner != subscribed || !is_child {
        owner
    } else {
        match source {
            Some(source) => source,
            None => optional_id(body, &["id"])?.ok_or_else(|| NormalizeError::MissingField {
                tag: "machine_update".to_string(),
                field: "source_machine_id",
            })?,
        }
    };

    let mut machine = parse_patch(body)?;
    let mut sources = vec![payload, body];
    if let Some(additional) = nested(payload, "additional_data") {
        sources.push(additional);
    }
    apply_kind_fields(kind, &mut machine, &sources, "machine_update")?;

    Ok(CanonicalEvent {
        kind,
        origin,
        target,
        machine,
        stations: None,
    })
}

/// Incremental events: signal, stop, resume, speed, rejects, production started.
fn normalize_partial(
    payload: &Object,
    kind: EventKind,
    origin: EventOrigin,
    subscribed: MachineId,
    tag: &str,
) -> Result<CanonicalEvent, NormalizeError> {
    let body = machine_body(payload);
    let mut machine = parse_patch(payload)?;
    if !std::ptr::eq(body, payload) {
        machine = machine.overlay(parse_patch(body)?);
    }

    let target = match optional_id(payload, &STATION_TARGET_KEYS)? {
        Some(station) => station,
        None => match optional_id(payload, &["id_maquina", "id"])? {
            Some(id) => id,
            None => optional_id(body, &["id", "id_maquina"])?.unwrap_or(subscribed),
        },
    };

    apply_kind_fields(kind, &mut machine, &[payload, body], tag)?;

    Ok(CanonicalEvent {
        kind,
        origin,
        target,
        machine,
        stations: None,
    })
}

/// Fields that only exist at the top level of specific event kinds.
fn apply_kind_fields(
    kind: EventKind,
    machine: &mut MachinePatch,
    sources: &[&Object],
    tag: &str,
) -> Result<(), NormalizeError> {
    match kind {
        EventKind::Stop { .. } if machine.active_stop.as_value().is_none() => {
            let stop = sources
                .iter()
                .find(|source| has_stop_fields(source))
                .map(|source| top_level_stop(source))
                .unwrap_or_default();
            machine.active_stop = Field::Value(stop);
        }
        EventKind::RejectsAdded => {
            for source in sources {
                if let Some(quantity) = optional_counter(source, "quantidade")? {
                    machine.reject_quantity = Some(quantity);
                    break;
                }
            }
        }
        EventKind::StopJustified => {
            let stop_id = sources
                .iter()
                .find_map(|source| {
                    opt_i64(source, "id_parada")
                        .or_else(|| nested(source, "parada").and_then(|p| opt_i64(p, "id")))
                })
                .ok_or_else(|| NormalizeError::MissingField {
                    tag: tag.to_string(),
                    field: "id_parada",
                })?;
            let reason_id = sources
                .iter()
                .find_map(|source| opt_i64(source, "id_motivo").or_else(|| opt_i64(source, "motivo_id")))
                .ok_or_else(|| NormalizeError::MissingField {
                    tag: tag.to_string(),
                    field: "id_motivo",
                })?;
            machine.justification = Some(StopJustification { stop_id, reason_id });
        }
        EventKind::Speed if machine.speed.is_none() => {
            return Err(NormalizeError::MissingField {
                tag: tag.to_string(),
                field: "velocidade",
            });
        }
        _ => {}
    }
    Ok(())
}

fn normalize_alert(payload: &Object, subscribed: MachineId) -> Result<ProductionAlert, NormalizeError> {
    let machine_id = optional_id(payload, &["target_machine_id", "id_maquina"])?.unwrap_or(subscribed);
    let station_id = optional_id(payload, &["source_machine_id"])?.filter(|source| *source != machine_id);
    let kind = match payload.get("alert_type").and_then(Value::as_str) {
        Some("meta_atingida") => AlertKind::GoalReached,
        Some("proximo_meta") => AlertKind::NearGoal,
        Some(other) => AlertKind::Other(other.to_string()),
        None => AlertKind::Other("unspecified".to_string()),
    };
    let data = nested(payload, "alert_data").unwrap_or(payload);

    Ok(ProductionAlert {
        machine_id,
        station_id,
        kind,
        valid_signal_count: counter(data, "sinais_validos")?,
        quantity_to_produce: counter(data, "qt_produzir")?,
        percent: opt_f64(data, "percentual").unwrap_or(0.0),
        remaining: opt_i64(data, "saldo"),
        message: data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn parse_patch(obj: &Object) -> Result<MachinePatch, NormalizeError> {
    Ok(MachinePatch {
        name: obj.get("nome").and_then(Value::as_str).map(str::to_string),
        parent_id: match obj.get("maquina_pai") {
            None => Field::Absent,
            Some(Value::Null) => Field::Null,
            Some(value) => MachineId::from_json(value).map_or(Field::Null, Field::Value),
        },
        is_multi_station: opt_bool(obj, "multipostos"),
        speed: opt_f64(obj, "velocidade"),
        active_stop: parse_record(obj, "parada_ativa", parse_stop)?,
        last_stop: parse_record(obj, "ultima_parada", parse_last_stop)?,
        operator_session: parse_record(obj, "sessao_operador", parse_session)?,
        shift_production: parse_record(obj, "producao_turno", parse_shift)?,
        map_production: parse_record(obj, "producao_mapa", parse_map)?,
        reject_quantity: None,
        justification: None,
    })
}

fn parse_record<T>(
    obj: &Object,
    key: &'static str,
    parse: fn(&Object) -> Result<T, NormalizeError>,
) -> Result<Field<T>, NormalizeError> {
    match obj.get(key) {
        None => Ok(Field::Absent),
        Some(Value::Null) => Ok(Field::Null),
        Some(Value::Object(inner)) => parse(inner).map(Field::Value),
        Some(other) => {
            tracing::warn!(field = key, value = %other, "Ignoring sub-record that is not an object");
            Ok(Field::Absent)
        }
    }
}

fn parse_counters(obj: &Object) -> Result<Counters, NormalizeError> {
    Ok(Counters::new(
        counter(obj, "sinais")?,
        counter(obj, "sinais_validos")?,
        counter(obj, "rejeitos")?,
    ))
}

fn parse_session(obj: &Object) -> Result<SessionProduction, NormalizeError> {
    Ok(SessionProduction {
        session_id: opt_i64(obj, "id_sessao"),
        operator_id: opt_i64(obj, "id_operador"),
        counters: parse_counters(obj)?,
        elapsed_seconds: counter(obj, "tempo_decorrido_segundos")?,
        stopped_seconds: counter(obj, "tempo_paradas_segundos")?,
        valid_seconds: counter(obj, "tempo_valido_segundos")?,
    })
}

fn parse_shift(obj: &Object) -> Result<ShiftProduction, NormalizeError> {
    Ok(ShiftProduction {
        shift_id: opt_i64(obj, "id_turno"),
        counters: parse_counters(obj)?,
        elapsed_seconds: counter(obj, "tempo_decorrido_segundos")?,
        stopped_seconds: counter(obj, "tempo_paradas_segundos")?,
        valid_seconds: counter(obj, "tempo_valido_segundos")?,
    })
}

fn parse_map(obj: &Object) -> Result<MapProduction, NormalizeError> {
    Ok(MapProduction {
        map_id: opt_i64(obj, "id_mapa"),
        item_id: opt_i64(obj, "id_item_mapa"),
        product_ref: opt_i64(obj, "id_produto"),
        color_ref: opt_i64(obj, "id_cor"),
        mold_ref: opt_i64(obj, "id_matriz"),
        quantity_to_produce: counter(obj, "qt_produzir")?,
        counters: parse_counters(obj)?,
        remaining_to_produce: opt_i64(obj, "saldo_a_produzir").unwrap_or(0),
        started_at: opt_unix_seconds(obj, "inicio"),
    })
}

fn has_stop_fields(obj: &Object) -> bool {
    ["id_parada", "inicio", "id_motivo", "motivo_id", "bloqueia_sinais"]
        .iter()
        .any(|key| obj.contains_key(*key))
}

fn parse_stop(obj: &Object) -> Result<StopPatch, NormalizeError> {
    Ok(StopPatch {
        id: opt_i64(obj, "id").or_else(|| opt_i64(obj, "id_parada")),
        started_at_unix_seconds: opt_unix_seconds(obj, "inicio"),
        reason_id: opt_i64(obj, "motivo_id").or_else(|| opt_i64(obj, "id_motivo")),
        blocks_signals: opt_bool(obj, "bloqueia_sinais").unwrap_or(false),
    })
}

/// Stop fields sent beside the machine id rather than inside `parada_ativa`.
fn top_level_stop(obj: &Object) -> StopPatch {
    StopPatch {
        id: opt_i64(obj, "id_parada"),
        started_at_unix_seconds: opt_unix_seconds(obj, "inicio"),
        reason_id: opt_i64(obj, "id_motivo").or_else(|| opt_i64(obj, "motivo_id")),
        blocks_signals: opt_bool(obj, "bloqueia_sinais").unwrap_or(false),
    }
}

fn parse_last_stop(obj: &Object) -> Result<LastStop, NormalizeError> {
    Ok(LastStop {
        id: opt_i64(obj, "id").or_else(|| opt_i64(obj, "id_parada")),
        started_at_unix_seconds: opt_unix_seconds(obj, "inicio"),
        ended_at_unix_seconds: opt_unix_seconds(obj, "fim"),
        reason_id: opt_i64(obj, "motivo_id").or_else(|| opt_i64(obj, "id_motivo")),
        justified: opt_bool(obj, "justificada").unwrap_or(false),
    })
}

fn nested<'a>(obj: &'a Object, key: &str) -> Option<&'a Object> {
    obj.get(key).and_then(Value::as_object)
}

fn machine_body(payload: &Object) -> &Object {
    MACHINE_BODY_KEYS
        .iter()
        .find_map(|key| nested(payload, key))
        .unwrap_or(payload)
}

fn context_body(payload: &Object) -> &Object {
    CONTEXT_BODY_KEYS
        .iter()
        .find_map(|key| nested(payload, key))
        .unwrap_or(payload)
}

fn first_present<'a>(objects: &[&'a Object], keys: &[&str]) -> Option<&'a Value> {
    objects.iter().find_map(|obj| {
        keys.iter()
            .find_map(|key| obj.get(*key).filter(|value| !value.is_null()))
    })
}

/// First non-null id among `keys`. A present but invalid id is an error.
fn optional_id(obj: &Object, keys: &[&'static str]) -> Result<Option<MachineId>, NormalizeError> {
    for &key in keys {
        match obj.get(key) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                return MachineId::from_json(value)
                    .map(Some)
                    .ok_or_else(|| NormalizeError::InvalidId {
                        field: key,
                        value: value.to_string(),
                    });
            }
        }
    }
    Ok(None)
}

/// Missing or null counters count as zero.
fn counter(obj: &Object, key: &'static str) -> Result<u64, NormalizeError> {
    Ok(optional_counter(obj, key)?.unwrap_or(0))
}

fn optional_counter(obj: &Object, key: &'static str) -> Result<Option<u64>, NormalizeError> {
    let malformed = |value: &Value| NormalizeError::MalformedCounter {
        field: key,
        value: value.to_string(),
    };
    let value = match obj.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let Value::Number(n) = value else {
        return Err(malformed(value));
    };
    if let Some(raw) = n.as_u64() {
        return Ok(Some(raw));
    }
    match n.as_f64() {
        Some(raw) if raw.is_finite() && raw >= 0.0 => Ok(Some(raw.round() as u64)),
        _ => Err(malformed(value)),
    }
}

fn opt_i64(obj: &Object, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn opt_f64(obj: &Object, key: &str) -> Option<f64> {
    let value = match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

fn opt_bool(obj: &Object, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Unix seconds from a number (seconds or milliseconds) or an RFC 3339 string.
fn opt_unix_seconds(obj: &Object, key: &str) -> Option<i64> {
    const MILLIS_THRESHOLD: i64 = 100_000_000_000;
    match obj.get(key)? {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
            Some(if raw > MILLIS_THRESHOLD { raw / 1000 } else { raw })
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|time| time.timestamp())
            .ok()
            .or_else(|| s.trim().parse().ok()),
        _ => None,
    }
}
