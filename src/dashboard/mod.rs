use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::SchedulerError;
use crate::scheduler::{register_action, unregister_action, ActionDefinition, Scheduler};

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: Scheduler,
}

#[derive(Serialize)]
struct SchedulerStatusResponse {
    active: bool,
    tracked_actions: usize,
    action_types: Vec<String>,
}

#[derive(Serialize)]
struct ActionResponse {
    id: String,
    #[serde(rename = "type")]
    action_type: String,
    deployment_id: String,
    interval_secs: f64,
    data: HashMap<String, String>,
    running: bool,
}

#[derive(Serialize)]
struct RegisterActionResponse {
    success: bool,
    id: Option<String>,
    error: Option<String>,
}

/// Routes of the status API, without the listener.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/scheduler", get(scheduler_status_handler))
        .route(
            "/api/actions",
            get(list_actions_handler).post(register_action_handler),
        )
        .route("/api/actions/:id", delete(unregister_action_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the status API until `shutdown` is cancelled.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn scheduler_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let tracked = state.scheduler.tracked_actions().await;

    Json(SchedulerStatusResponse {
        active: state.scheduler.is_active(),
        tracked_actions: tracked.len(),
        action_types: state.scheduler.dispatcher().action_types(),
    })
}

async fn list_actions_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let actions: Vec<ActionResponse> = state
        .scheduler
        .tracked_actions()
        .await
        .into_iter()
        .map(|action| ActionResponse {
            id: action.id.clone(),
            action_type: action.action_type.clone(),
            deployment_id: action.deployment_id.clone(),
            interval_secs: action.interval.as_secs_f64(),
            data: action.data.clone(),
            running: action.is_running(),
        })
        .collect();

    Json(actions)
}

async fn register_action_handler(
    State(state): State<DashboardState>,
    Json(definition): Json<ActionDefinition>,
) -> impl IntoResponse {
    let store = state.scheduler.store();
    match register_action(store.as_ref(), state.scheduler.config(), &definition).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(RegisterActionResponse {
                success: true,
                id: Some(id),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                SchedulerError::InvalidInterval { .. }
                | SchedulerError::MissingField { .. }
                | SchedulerError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(RegisterActionResponse {
                    success: false,
                    id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn unregister_action_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.scheduler.store();
    match unregister_action(store.as_ref(), state.scheduler.config(), &id).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(SchedulerError::ActionNotFound(_)) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::warn!(action_id = %id, error = %e, "Failed to unregister action");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
