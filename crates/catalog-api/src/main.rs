//! AppHub Catalog's thin HTTP surface (`SPEC_FULL.md` §2, §6): run
//! creation/cancellation, bundle publish/download, and stale marking.
//! Everything else named in `spec.md` §1's "deliberately out of scope"
//! list lives outside this binary. Structurally this mirrors
//! `everruns-api::main`: one `tracing_subscriber` init, one `AppState`
//! assembled once, one `Router` merged from per-module route sets.

mod assets;
mod auth;
mod bundles;
mod config;
mod definitions;
mod error;
mod runs;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use catalog_engine::{AssetLedger, BundlePublisher, EnvServiceResolver, JobHandlerRegistry, OrchestratorConfig, RunOrchestrator, StepExecutor};
use catalog_storage::PostgresStateStore;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::Config;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "AppHub Catalog",
        version = "0.1.0",
        description = "Workflow execution engine: definitions, runs, job bundles, and the asset ledger",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    tags(
        (name = "workflows", description = "Workflow definition and run endpoints"),
        (name = "job-bundles", description = "Job bundle publish/download endpoints"),
        (name = "assets", description = "Asset ledger stale-marking and inspection endpoints"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "catalog=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("catalog-api starting...");

    let config = Config::from_env()?;

    let store: Arc<dyn catalog_storage::StateStore> = Arc::new(
        PostgresStateStore::connect(&config.database_url)
            .await
            .map_err(|err| anyhow::anyhow!(err.message))
            .context("failed to connect to Postgres and apply schema migrations")?,
    );
    tracing::info!("connected to Postgres and applied migrations");

    let bus = catalog_events::bus_from_env().await;

    let executor = Arc::new(StepExecutor::new(JobHandlerRegistry::new(), Arc::new(EnvServiceResolver)));
    let orchestrator = Arc::new(RunOrchestrator::new(store.clone(), bus.clone(), executor, OrchestratorConfig::default()));
    let assets = Arc::new(AssetLedger::new(store.clone()));
    let bundle_publisher = Arc::new(BundlePublisher::new(store.clone()));
    let config = Arc::new(config);

    let state = AppState {
        store,
        orchestrator,
        assets,
        bundles: bundle_publisher,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", axum::routing::get(health))
        .merge(definitions::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(bundles::routes(state.clone()))
        .merge(assets::routes(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}
