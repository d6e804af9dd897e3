// HTTP request handlers
use crate::application::state_store::StoreClosed;
use crate::domain::command::{CommandOutcome, ConsoleCommand};
use crate::domain::event::ProductionAlert;
use crate::domain::machine::{MachineId, MachineView};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, WatchStream};
use tokio_stream::StreamExt;

enum FeedItem {
    View(Arc<MachineView>),
    Alert(ProductionAlert),
    Closed,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Reconciled view, connection status and last command error of a machine
pub async fn get_machine(Path(id): Path<u64>, State(state): State<Arc<AppState>>) -> Response {
    let Some(machine_id) = MachineId::new(id) else {
        return invalid_machine_id(id);
    };
    match state.console.machine_state(machine_id).await {
        Ok(Some(machine)) => Json(machine).into_response(),
        Ok(None) => not_tracked(machine_id),
        Err(e) => store_unavailable(e),
    }
}

pub async fn subscribe_machine(Path(id): Path<u64>, State(state): State<Arc<AppState>>) -> Response {
    let Some(machine_id) = MachineId::new(id) else {
        return invalid_machine_id(id);
    };
    match state.console.subscribe(machine_id).await {
        Ok(started) => {
            let status = if started { StatusCode::CREATED } else { StatusCode::OK };
            (status, Json(json!({"machine_id": machine_id, "started": started}))).into_response()
        }
        Err(e) => store_unavailable(e),
    }
}

pub async fn unsubscribe_machine(Path(id): Path<u64>, State(state): State<Arc<AppState>>) -> Response {
    let Some(machine_id) = MachineId::new(id) else {
        return invalid_machine_id(id);
    };
    match state.console.unsubscribe(machine_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_tracked(machine_id),
        Err(e) => store_unavailable(e),
    }
}

/// Operator-requested full resync
pub async fn resync_machine(Path(id): Path<u64>, State(state): State<Arc<AppState>>) -> Response {
    let Some(machine_id) = MachineId::new(id) else {
        return invalid_machine_id(id);
    };
    match state.console.resync(machine_id).await {
        Ok(Some(outcome)) => outcome_response(outcome),
        Ok(None) => not_tracked(machine_id),
        Err(e) => store_unavailable(e),
    }
}

pub async fn post_command(
    Path(id): Path<u64>,
    State(state): State<Arc<AppState>>,
    Json(command): Json<ConsoleCommand>,
) -> Response {
    let Some(machine_id) = MachineId::new(id) else {
        return invalid_machine_id(id);
    };
    match state.console.execute(machine_id, &command).await {
        Ok(Some(outcome)) => outcome_response(outcome),
        Ok(None) => not_tracked(machine_id),
        Err(e) => store_unavailable(e),
    }
}

/// SSE feed of reconciled views and production alerts for one machine
pub async fn machine_events(Path(id): Path<u64>, State(state): State<Arc<AppState>>) -> Response {
    let Some(machine_id) = MachineId::new(id) else {
        return invalid_machine_id(id);
    };
    let views = match state.console.watch(machine_id).await {
        Ok(Some(views)) => views,
        Ok(None) => return not_tracked(machine_id),
        Err(e) => return store_unavailable(e),
    };

    // The view stream ends when the machine is unsubscribed; that closes the feed.
    let views = WatchStream::new(views)
        .filter_map(|view| view.map(FeedItem::View))
        .chain(tokio_stream::once(FeedItem::Closed));
    let alerts = BroadcastStream::new(state.console.alerts()).filter_map(move |item| match item {
        Ok(alert) if alert.machine_id == machine_id => Some(FeedItem::Alert(alert)),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(machine_id = %machine_id, skipped, "Event feed lagging, alerts dropped");
            None
        }
    });
    let stream = views
        .merge(alerts)
        .take_while(|item| !matches!(item, FeedItem::Closed))
        .filter_map(|item| match item {
            FeedItem::View(view) => json_event("view", &*view),
            FeedItem::Alert(alert) => json_event("alert", &alert),
            FeedItem::Closed => None,
        })
        .map(Ok::<Event, Infallible>);

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}

fn json_event<T: serde::Serialize>(name: &str, payload: &T) -> Option<Event> {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!(event = name, error = %e, "Failed to encode event");
            None
        }
    }
}

fn outcome_response(outcome: CommandOutcome) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(outcome)).into_response()
}

fn invalid_machine_id(id: u64) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("invalid machine id: {}", id)})),
    )
        .into_response()
}

fn not_tracked(machine_id: MachineId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("machine {} is not subscribed", machine_id)})),
    )
        .into_response()
}

fn store_unavailable(e: StoreClosed) -> Response {
    tracing::error!(error = %e, "State store unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}
