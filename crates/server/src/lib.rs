pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use config::ServerConfig;
use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "SCORCH API",
        version = "0.1.0",
        description = "Component pipeline runs, output streams and breakpoint terminals"
    ),
    paths(
        routes::health_check,
        routes::start_run,
        routes::cancel_run,
        routes::get_active_run,
        routes::get_pipeline,
        routes::rebuild_pipelines,
        routes::reset_experiment,
        routes::get_component_output,
        routes::list_terminals,
        routes::claim_terminal,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::RunResponse,
        routes::ActiveRunResponse,
        routes::RebuildResponse,
        routes::ClaimRequest,
        routes::ClaimResponse,
        error::ErrorResponse,
        scorch::ComponentOutput,
        scorch::TerminalInfo,
        scorch::Access,
        scorch_core::Stage,
        scorch_core::ComponentStatus,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "runs", description = "Start and cancel runs"),
        (name = "pipelines", description = "Per-loop pipeline graphs"),
        (name = "components", description = "Component output"),
        (name = "terminals", description = "Breakpoint terminal negotiation"),
    )
)]
pub struct ApiDoc;

const COMPONENT: &str =
    "/api/experiments/{experiment}/runs/{run}/loops/{loop}/stages/{stage}/components/{name}";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route(
            "/api/experiments/{experiment}/runs/{run}/start",
            post(routes::start_run),
        )
        .route("/api/experiments/{experiment}/cancel", post(routes::cancel_run))
        .route("/api/experiments/{experiment}/run", get(routes::get_active_run))
        .route(
            "/api/experiments/{experiment}/runs/{run}/loops/{loop}/pipeline",
            get(routes::get_pipeline),
        )
        .route(
            "/api/experiments/{experiment}/pipelines/rebuild",
            post(routes::rebuild_pipelines),
        )
        .route(
            "/api/experiments/{experiment}/scorch",
            delete(routes::reset_experiment),
        )
        .route(
            &format!("{}/output", COMPONENT),
            get(routes::get_component_output),
        )
        .route(
            &format!("{}/output/ws", COMPONENT),
            get(routes::component_output_ws),
        )
        .route(
            &format!("{}/terminal", COMPONENT),
            post(routes::claim_terminal),
        )
        .route("/api/terminals", get(routes::list_terminals))
        .route("/api/terminals/{pid}/ws", get(routes::terminal_ws))
        .route("/api/events/ws", get(routes::events_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
