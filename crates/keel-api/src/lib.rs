//! keel-api: REST API for Keel.
//!
//! Every route acts on behalf of the user named in the `x-keel-owner`
//! header and answers with a `{success, data?, error?}` envelope, except
//! node converge output and app logs which are plain text.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET/POST | `/api/v1/providers` | List / store provider credentials |
//! | GET/POST | `/api/v1/flavors` | List / create flavors |
//! | GET/PATCH/DELETE | `/api/v1/flavors/{id}` | Get / merge-update / destroy a flavor |
//! | GET/POST | `/api/v1/formations` | List / create formations |
//! | GET/DELETE | `/api/v1/formations/{id}` | Get / destroy a formation |
//! | POST | `/api/v1/formations/{id}/scale` | Scale layers to node counts |
//! | POST | `/api/v1/formations/{id}/balance` | Rebalance containers |
//! | POST | `/api/v1/formations/{id}/calculate` | Render the databag |
//! | POST | `/api/v1/formations/{id}/converge` | Converge every up node |
//! | GET/POST | `/api/v1/formations/{id}/layers` | List / create layers |
//! | GET/DELETE | `/api/v1/formations/{id}/layers/{layer}` | Get / destroy a layer |
//! | GET/POST | `/api/v1/formations/{id}/nodes` | List / add nodes |
//! | DELETE | `/api/v1/formations/{id}/nodes/{node}` | Destroy a node |
//! | GET | `/api/v1/nodes` | List the caller's nodes |
//! | GET/DELETE | `/api/v1/nodes/{id}` | Get / destroy a node |
//! | POST | `/api/v1/nodes/{id}/converge` | Converge one node (plain text) |
//! | POST | `/api/v1/nodes/{id}/down` | Mark a node down and rebalance |
//! | GET/POST | `/api/v1/apps` | List / create apps |
//! | GET/DELETE | `/api/v1/apps/{id}` | Get / destroy an app |
//! | POST | `/api/v1/apps/{id}/scale` | Scale container types |
//! | POST | `/api/v1/apps/{id}/calculate` | Render the app databag |
//! | GET | `/api/v1/apps/{id}/logs` | App logs (plain text) |
//! | POST | `/api/v1/apps/{id}/run` | Run a one-off command |
//! | GET/POST | `/api/v1/apps/{id}/config` | Latest / new config |
//! | GET/POST | `/api/v1/apps/{id}/builds` | Latest / new build |
//! | GET | `/api/v1/apps/{id}/releases` | Latest release |
//! | GET | `/api/v1/apps/{id}/containers[/{type}[/{num}]]` | Containers |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use keel_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/providers", get(handlers::list_providers).post(handlers::put_provider))
        .route("/flavors", get(handlers::list_flavors).post(handlers::create_flavor))
        .route(
            "/flavors/{id}",
            get(handlers::get_flavor)
                .patch(handlers::update_flavor)
                .delete(handlers::destroy_flavor),
        )
        .route("/formations", get(handlers::list_formations).post(handlers::create_formation))
        .route("/formations/{id}", get(handlers::get_formation).delete(handlers::destroy_formation))
        .route("/formations/{id}/scale", post(handlers::scale_formation))
        .route("/formations/{id}/balance", post(handlers::balance_formation))
        .route("/formations/{id}/calculate", post(handlers::calculate_formation))
        .route("/formations/{id}/converge", post(handlers::converge_formation))
        .route("/formations/{id}/layers", get(handlers::list_layers).post(handlers::create_layer))
        .route(
            "/formations/{id}/layers/{layer}",
            get(handlers::get_layer).delete(handlers::destroy_layer),
        )
        .route(
            "/formations/{id}/nodes",
            get(handlers::list_formation_nodes).post(handlers::add_node),
        )
        .route("/formations/{id}/nodes/{node}", delete(handlers::destroy_formation_node))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node).delete(handlers::destroy_node))
        .route("/nodes/{id}/converge", post(handlers::converge_node))
        .route("/nodes/{id}/down", post(handlers::mark_node_down))
        .route("/apps", get(handlers::list_apps).post(handlers::create_app))
        .route("/apps/{id}", get(handlers::get_app).delete(handlers::destroy_app))
        .route("/apps/{id}/scale", post(handlers::scale_app))
        .route("/apps/{id}/calculate", post(handlers::calculate_app))
        .route("/apps/{id}/logs", get(handlers::app_logs))
        .route("/apps/{id}/run", post(handlers::run_app))
        .route("/apps/{id}/config", get(handlers::latest_config).post(handlers::create_config))
        .route("/apps/{id}/builds", get(handlers::latest_build).post(handlers::create_build))
        .route("/apps/{id}/releases", get(handlers::latest_release))
        .route("/apps/{id}/containers", get(handlers::list_containers))
        .route("/apps/{id}/containers/{type}", get(handlers::list_containers_of_type))
        .route("/apps/{id}/containers/{type}/{num}", get(handlers::get_container))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
