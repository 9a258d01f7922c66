//! REST API handlers.
//!
//! Handlers are thin: extract the caller, call the orchestrator, map the
//! result onto the response envelope.

use axum::Json;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use keel_orchestrator::{
    AppInput, BuildInput, FlavorInput, FlavorUpdate, FormationInput, LayerInput, NodeInput,
    OrchestratorError, OrchestratorResult, ProviderInput,
};
use keel_state::{App, Formation, Layer};

use crate::ApiState;

/// Header naming the user a request acts for.
pub const OWNER_HEADER: &str = "x-keel-owner";

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for an orchestrator error.
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::InvalidScaleFormat(_)
        | OrchestratorError::NoProviderCredentials
        | OrchestratorError::NoEligibleNode(_)
        | OrchestratorError::LayerNotFound(_)
        | OrchestratorError::ProviderFailure(_)
        | OrchestratorError::ConvergeFailure(_)
        | OrchestratorError::Environment(_)
        | OrchestratorError::FormationAppLimit(_)
        | OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::DuplicateNode { .. }
        | OrchestratorError::DuplicateLayer(_)
        | OrchestratorError::AlreadyExists { .. } => StatusCode::CONFLICT,
        OrchestratorError::NotFound(_) | OrchestratorError::NoLogs(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Internal(_) | OrchestratorError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, result: OrchestratorResult<T>) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => {
            debug!(error = %e, "request failed");
            error_response(&e.to_string(), status_for(&e))
        }
    }
}

fn ok<T: Serialize>(result: OrchestratorResult<T>) -> Response {
    reply(StatusCode::OK, result)
}

fn created<T: Serialize>(result: OrchestratorResult<T>) -> Response {
    reply(StatusCode::CREATED, result)
}

fn destroyed(result: OrchestratorResult<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)),
    }
}

fn plain_text(result: OrchestratorResult<String>) -> Response {
    match result {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)),
    }
}

// ── Caller ─────────────────────────────────────────────────────

/// The user a request acts for, from the `x-keel-owner` header.
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or_else(|| {
                error_response(
                    &format!("missing {OWNER_HEADER} header"),
                    StatusCode::UNAUTHORIZED,
                )
            })
    }
}

// ── Layer view ─────────────────────────────────────────────────

/// A layer as the API shows it: the private key only on creation.
#[derive(Debug, Serialize)]
pub struct LayerView {
    pub id: String,
    pub formation: String,
    pub owner: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    pub instance_type: String,
    pub params: Map<String, Value>,
    pub runtime: bool,
    pub proxy: bool,
    pub container_types: Vec<String>,
    pub ssh_username: String,
    pub ssh_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
    pub created_at: u64,
}

impl LayerView {
    fn new(layer: Layer, with_private_key: bool) -> Self {
        Self {
            id: layer.id,
            formation: layer.formation,
            owner: layer.owner,
            provider: layer.provider,
            flavor: layer.flavor,
            instance_type: layer.instance_type,
            params: layer.params,
            runtime: layer.runtime,
            proxy: layer.proxy,
            container_types: layer.container_types,
            ssh_username: layer.ssh_username,
            ssh_public_key: layer.ssh_keypair.public_key,
            ssh_private_key: with_private_key.then_some(layer.ssh_keypair.private_key),
            created_at: layer.created_at,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

/// GET /api/v1/providers
pub async fn list_providers(State(state): State<ApiState>, Owner(user): Owner) -> Response {
    ok(state.orchestrator.list_providers(&user))
}

/// POST /api/v1/providers
pub async fn put_provider(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Json(input): Json<ProviderInput>,
) -> Response {
    created(state.orchestrator.put_provider(&user, input))
}

// ── Flavors ────────────────────────────────────────────────────

/// GET /api/v1/flavors
pub async fn list_flavors(State(state): State<ApiState>, Owner(user): Owner) -> Response {
    ok(state.orchestrator.list_flavors(&user))
}

/// POST /api/v1/flavors
pub async fn create_flavor(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Json(input): Json<FlavorInput>,
) -> Response {
    created(state.orchestrator.create_flavor(&user, input))
}

/// GET /api/v1/flavors/{id}
pub async fn get_flavor(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.get_flavor(&user, &id))
}

/// PATCH /api/v1/flavors/{id}
pub async fn update_flavor(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(update): Json<FlavorUpdate>,
) -> Response {
    ok(state.orchestrator.update_flavor(&user, &id, update))
}

/// DELETE /api/v1/flavors/{id}
pub async fn destroy_flavor(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    destroyed(state.orchestrator.destroy_flavor(&user, &id))
}

// ── Formations ─────────────────────────────────────────────────

/// GET /api/v1/formations
pub async fn list_formations(State(state): State<ApiState>, Owner(user): Owner) -> Response {
    ok(state.orchestrator.list_formations(&user))
}

/// POST /api/v1/formations
pub async fn create_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Json(input): Json<FormationInput>,
) -> Response {
    created(state.orchestrator.create_formation(&user, input).await)
}

/// GET /api/v1/formations/{id}
pub async fn get_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.get::<Formation>(&user, &id))
}

/// DELETE /api/v1/formations/{id}
pub async fn destroy_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    destroyed(state.orchestrator.destroy::<Formation>(&user, &id).await)
}

/// POST /api/v1/formations/{id}/scale
pub async fn scale_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    ok(state.orchestrator.scale_formation(&user, &id, &body).await)
}

/// POST /api/v1/formations/{id}/balance
pub async fn balance_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.balance_formation(&user, &id).await)
}

/// POST /api/v1/formations/{id}/calculate
pub async fn calculate_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.calculate_formation(&user, &id))
}

/// POST /api/v1/formations/{id}/converge
pub async fn converge_formation(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.converge_formation(&user, &id).await)
}

// ── Layers ─────────────────────────────────────────────────────

/// GET /api/v1/formations/{id}/layers
pub async fn list_layers(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.list_layers(&user, &id).map(|layers| {
        layers
            .into_iter()
            .map(|l| LayerView::new(l, false))
            .collect::<Vec<_>>()
    }))
}

/// POST /api/v1/formations/{id}/layers
pub async fn create_layer(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(input): Json<LayerInput>,
) -> Response {
    let result = state.orchestrator.create_layer(&user, &id, input).await;
    created(result.map(|l| LayerView::new(l, true)))
}

/// GET /api/v1/formations/{id}/layers/{layer}
pub async fn get_layer(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path((id, layer)): Path<(String, String)>,
) -> Response {
    ok(state
        .orchestrator
        .get_layer(&user, &id, &layer)
        .map(|l| LayerView::new(l, false)))
}

/// DELETE /api/v1/formations/{id}/layers/{layer}
pub async fn destroy_layer(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path((id, layer)): Path<(String, String)>,
) -> Response {
    let key = keel_state::layer_key(&id, &layer);
    destroyed(state.orchestrator.destroy::<Layer>(&user, &key).await)
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/formations/{id}/nodes
pub async fn list_formation_nodes(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.list_formation_nodes(&user, &id))
}

/// POST /api/v1/formations/{id}/nodes
pub async fn add_node(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(input): Json<NodeInput>,
) -> Response {
    created(state.orchestrator.add_node(&user, &id, input).await)
}

/// DELETE /api/v1/formations/{id}/nodes/{node}
pub async fn destroy_formation_node(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path((id, node)): Path<(String, String)>,
) -> Response {
    let result = match state.orchestrator.get_node(&user, &node) {
        Ok(n) if n.formation == id => state.orchestrator.destroy_node(&user, &node).await,
        Ok(_) => Err(OrchestratorError::NotFound(format!("node {node}"))),
        Err(e) => Err(e),
    };
    destroyed(result)
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>, Owner(user): Owner) -> Response {
    ok(state.orchestrator.list_nodes(&user))
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.get_node(&user, &id))
}

/// DELETE /api/v1/nodes/{id}
pub async fn destroy_node(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    destroyed(state.orchestrator.destroy_node(&user, &id).await)
}

/// POST /api/v1/nodes/{id}/converge
pub async fn converge_node(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    let result = state.orchestrator.converge_node(&user, &id).await;
    plain_text(result.map(|c| c.output))
}

/// POST /api/v1/nodes/{id}/down
pub async fn mark_node_down(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.mark_node_down(&user, &id).await)
}

// ── Apps ───────────────────────────────────────────────────────

/// GET /api/v1/apps
pub async fn list_apps(State(state): State<ApiState>, Owner(user): Owner) -> Response {
    ok(state.orchestrator.list_apps(&user))
}

/// POST /api/v1/apps
pub async fn create_app(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Json(input): Json<AppInput>,
) -> Response {
    created(state.orchestrator.create_app(&user, input).await)
}

/// GET /api/v1/apps/{id}
pub async fn get_app(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.get::<App>(&user, &id))
}

/// DELETE /api/v1/apps/{id}
pub async fn destroy_app(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    destroyed(state.orchestrator.destroy::<App>(&user, &id).await)
}

/// POST /api/v1/apps/{id}/scale
pub async fn scale_app(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    ok(state.orchestrator.scale_app(&user, &id, &body).await)
}

/// POST /api/v1/apps/{id}/calculate
pub async fn calculate_app(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.calculate_app(&user, &id))
}

/// GET /api/v1/apps/{id}/logs
pub async fn app_logs(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    plain_text(state.orchestrator.app_logs(&user, &id).await)
}

/// Run request body.
#[derive(Deserialize)]
pub struct RunRequest {
    pub command: String,
}

/// POST /api/v1/apps/{id}/run
pub async fn run_app(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(req): Json<RunRequest>,
) -> Response {
    ok(state.orchestrator.run_app(&user, &id, &req.command).await)
}

/// Config request body.
#[derive(Deserialize)]
pub struct ConfigRequest {
    pub values: Value,
}

/// GET /api/v1/apps/{id}/config
pub async fn latest_config(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.latest_config(&user, &id))
}

/// POST /api/v1/apps/{id}/config
pub async fn create_config(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(req): Json<ConfigRequest>,
) -> Response {
    created(state.orchestrator.create_config(&user, &id, &req.values).await)
}

/// GET /api/v1/apps/{id}/builds
pub async fn latest_build(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.latest_build(&user, &id))
}

/// POST /api/v1/apps/{id}/builds
pub async fn create_build(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
    Json(input): Json<BuildInput>,
) -> Response {
    created(state.orchestrator.create_build(&user, &id, input).await)
}

/// GET /api/v1/apps/{id}/releases
pub async fn latest_release(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.latest_release(&user, &id))
}

// ── Containers ─────────────────────────────────────────────────

/// GET /api/v1/apps/{id}/containers
pub async fn list_containers(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path(id): Path<String>,
) -> Response {
    ok(state.orchestrator.list_containers(&user, &id, None, None))
}

/// GET /api/v1/apps/{id}/containers/{type}
pub async fn list_containers_of_type(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path((id, container_type)): Path<(String, String)>,
) -> Response {
    ok(state
        .orchestrator
        .list_containers(&user, &id, Some(&container_type), None))
}

/// GET /api/v1/apps/{id}/containers/{type}/{num}
pub async fn get_container(
    State(state): State<ApiState>,
    Owner(user): Owner,
    Path((id, container_type, num)): Path<(String, String, u32)>,
) -> Response {
    let result = state
        .orchestrator
        .list_containers(&user, &id, Some(&container_type), Some(num))
        .map(|mut found| found.remove(0));
    ok(result)
}
