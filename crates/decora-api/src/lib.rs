//! REST API for the Decora Wi-Fi bridge
//!
//! Exposes entity states, service calls, config entries and the config and
//! options flows over HTTP using axum. Paths follow the Home Assistant REST
//! API so existing tooling can talk to the bridge.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use decora_config_entries::{
    ConfigEntries, ConfigEntriesError, ConfigEntry, FlowError, FlowManager, FlowResult,
};
use decora_core::{Context, State as EntityState};
use decora_registries::{DisabledBy, EntityEntry};
use decora_runtime::{Hub, ServiceDescription};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub entries: Arc<ConfigEntries>,
    pub flows: Arc<FlowManager>,
}

#[derive(Serialize)]
struct ApiStatus {
    message: &'static str,
}

/// Error body for every non-2xx response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
}

fn flow_error(err: FlowError) -> ApiError {
    let status = match &err {
        FlowError::UnknownFlow(_) | FlowError::UnknownHandler(_) | FlowError::UnknownEntry(_) => {
            StatusCode::NOT_FOUND
        }
        FlowError::NoOptionsFlow(_) | FlowError::UnknownStep(_) | FlowError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        FlowError::ConfigEntries(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.to_string())
}

/// Services of one domain
#[derive(Serialize)]
pub struct DomainServices {
    pub domain: String,
    pub services: Vec<ServiceDescription>,
}

/// Config entry as listed over HTTP; credentials are never included
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub source: decora_config_entries::ConfigEntrySource,
    pub state: decora_config_entries::ConfigEntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub disabled_by: Option<decora_config_entries::ConfigEntryDisabledBy>,
    pub supports_options: bool,
}

impl EntrySummary {
    fn new(entry: ConfigEntry, supports_options: bool) -> Self {
        Self {
            entry_id: entry.entry_id,
            domain: entry.domain,
            title: entry.title,
            source: entry.source,
            state: entry.state,
            reason: entry.reason,
            disabled_by: entry.disabled_by,
            supports_options,
        }
    }
}

/// Body of the flow start endpoints: a domain, or an entry id for options
#[derive(Deserialize)]
pub struct StartFlowRequest {
    pub handler: String,
}

/// Body of an entity registry update
///
/// Only the fields present in the body change; `{"disabled_by": null}`
/// enables an entity.
#[derive(Debug, Default, Deserialize)]
pub struct EntityRegistryUpdate {
    #[serde(default, deserialize_with = "present")]
    pub disabled_by: Option<Option<DisabledBy>>,
}

/// Tells an explicit `null` apart from a missing field
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/", get(api_status))
        .route("/api/health", get(health_check))
        // States
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        // Services
        .route("/api/services", get(get_services))
        .route("/api/services/:domain/:service", post(call_service))
        // Config entries
        .route("/api/config/config_entries/entry", get(list_config_entries))
        .route(
            "/api/config/config_entries/entry/:entry_id",
            delete(delete_config_entry),
        )
        // Entity registry
        .route("/api/config/entity_registry", get(list_entity_registry))
        .route(
            "/api/config/entity_registry/:entity_id",
            get(get_entity_registry_entry).post(update_entity_registry_entry),
        )
        // Config flows
        .route("/api/config/config_entries/flow", post(start_config_flow))
        .route(
            "/api/config/config_entries/flow/:flow_id",
            get(get_flow).post(progress_flow).delete(abort_flow),
        )
        // Options flows
        .route(
            "/api/config/config_entries/options/flow",
            post(start_options_flow),
        )
        .route(
            "/api/config/config_entries/options/flow/:flow_id",
            post(progress_flow).delete(abort_flow),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

// ==================== Handlers ====================

/// GET /api/
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.",
    })
}

/// GET /api/health
async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/states
async fn get_states(State(state): State<AppState>) -> Json<Vec<EntityState>> {
    let mut states = state.hub.states.all();
    states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    Json(states)
}

/// GET /api/states/{entity_id}
async fn get_state(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, ApiError> {
    state
        .hub
        .states
        .get(&entity_id)
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Entity not found: {}", entity_id)))
}

/// GET /api/services
async fn get_services(State(state): State<AppState>) -> Json<Vec<DomainServices>> {
    let services = state
        .hub
        .services
        .all_services()
        .into_iter()
        .map(|(domain, services)| DomainServices { domain, services })
        .collect();
    Json(services)
}

/// POST /api/services/{domain}/{service}
///
/// Responds with the states written while the call ran.
async fn call_service(
    State(state): State<AppState>,
    Path((domain, service)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<Json<Vec<EntityState>>, ApiError> {
    let service_data = body.map(|Json(data)| data).unwrap_or_else(|| json!({}));
    let started = Utc::now();

    state
        .hub
        .services
        .call(&domain, &service, service_data, Context::new())
        .await
        .map_err(|err| {
            warn!(%domain, %service, %err, "Service call over HTTP failed");
            error(StatusCode::BAD_REQUEST, format!("Service call failed: {}", err))
        })?;

    let changed = state
        .hub
        .states
        .all()
        .into_iter()
        .filter(|s| s.last_updated >= started)
        .collect();
    Ok(Json(changed))
}

/// GET /api/config/config_entries/entry
async fn list_config_entries(State(state): State<AppState>) -> Json<Vec<EntrySummary>> {
    let entries = state
        .entries
        .entries()
        .into_iter()
        .map(|entry| {
            let supports_options = state.flows.supports_options(&entry);
            EntrySummary::new(entry, supports_options)
        })
        .collect();
    Json(entries)
}

/// DELETE /api/config/config_entries/entry/{entry_id}
async fn delete_config_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> Response {
    info!("HTTP DELETE config entry: {}", entry_id);

    match state.entries.remove(&entry_id).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "require_restart": false }))).into_response(),
        Err(ConfigEntriesError::NotFound(_)) => error(
            StatusCode::NOT_FOUND,
            format!("Invalid entry specified: {}", entry_id),
        )
        .into_response(),
        Err(err) => {
            warn!("Failed to delete config entry {}: {}", entry_id, err);
            error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// GET /api/config/entity_registry
async fn list_entity_registry(State(state): State<AppState>) -> Json<Vec<EntityEntry>> {
    let mut entities: Vec<EntityEntry> = state
        .hub
        .registries
        .entities
        .iter()
        .into_iter()
        .map(|entry| (*entry).clone())
        .collect();
    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    Json(entities)
}

/// GET /api/config/entity_registry/{entity_id}
async fn get_entity_registry_entry(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityEntry>, ApiError> {
    state
        .hub
        .registries
        .entities
        .get(&entity_id)
        .map(|entry| Json((*entry).clone()))
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Entity not found: {}", entity_id)))
}

/// POST /api/config/entity_registry/{entity_id}
///
/// Enabling or disabling an entity reloads its config entry so the change
/// takes effect right away.
async fn update_entity_registry_entry(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(update): Json<EntityRegistryUpdate>,
) -> Result<Json<Value>, ApiError> {
    if let Some(Some(by)) = update.disabled_by {
        if by != DisabledBy::User {
            return Err(error(
                StatusCode::BAD_REQUEST,
                "disabled_by can only be set to user or null",
            ));
        }
    }

    let registry = &state.hub.registries.entities;
    let before = registry
        .get(&entity_id)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Entity not found: {}", entity_id)))?;
    let updated = registry
        .update(&entity_id, |entry| {
            if let Some(disabled_by) = update.disabled_by {
                entry.disabled_by = disabled_by;
            }
        })
        .map_err(|err| error(StatusCode::NOT_FOUND, err.to_string()))?;

    state.hub.registries.save_all().await.map_err(|err| {
        warn!(%entity_id, %err, "Failed to save the entity registry");
        error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })?;
    info!(%entity_id, disabled_by = ?updated.disabled_by, "Entity registry entry updated");

    let owner = updated
        .config_entry_id
        .as_deref()
        .and_then(|entry_id| state.entries.get(entry_id));
    let mut require_restart = false;
    if let Some(entry) = owner.filter(|_| before.disabled_by != updated.disabled_by) {
        if entry.is_loaded() {
            if let Err(err) = state.entries.reload(&entry.entry_id).await {
                warn!(entry_id = %entry.entry_id, %err, "Reload after entity registry change failed");
                require_restart = true;
            }
        } else {
            require_restart = true;
        }
    }

    Ok(Json(json!({
        "entity_entry": &*updated,
        "require_restart": require_restart,
    })))
}

/// POST /api/config/config_entries/flow
async fn start_config_flow(
    State(state): State<AppState>,
    Json(request): Json<StartFlowRequest>,
) -> Result<Json<FlowResult>, ApiError> {
    state
        .flows
        .start_config_flow(&request.handler)
        .await
        .map(Json)
        .map_err(flow_error)
}

/// POST /api/config/config_entries/options/flow
async fn start_options_flow(
    State(state): State<AppState>,
    Json(request): Json<StartFlowRequest>,
) -> Result<Json<FlowResult>, ApiError> {
    state
        .flows
        .start_options_flow(&request.handler)
        .await
        .map(Json)
        .map_err(flow_error)
}

/// GET /api/config/config_entries/flow/{flow_id}
async fn get_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Json<FlowResult>, ApiError> {
    state
        .flows
        .get(&flow_id)
        .await
        .map(Json)
        .ok_or_else(|| flow_error(FlowError::UnknownFlow(flow_id)))
}

/// POST to a config or options flow
async fn progress_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<FlowResult>, ApiError> {
    let user_input = body.map(|Json(input)| input).unwrap_or_else(|| json!({}));
    state
        .flows
        .progress(&flow_id, user_input)
        .await
        .map(Json)
        .map_err(flow_error)
}

/// DELETE a config or options flow
async fn abort_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.flows.abort(&flow_id).map_err(flow_error)?;
    Ok(Json(json!({ "message": "Flow aborted" })))
}
