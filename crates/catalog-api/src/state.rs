//! Shared application state, assembled once in `main` and cloned (cheaply,
//! via `Arc`) into each route module's own `AppState`, mirroring
//! `everruns-api::main`'s per-module state pattern.

use std::sync::Arc;

use catalog_engine::{AssetLedger, BundlePublisher, RunOrchestrator};
use catalog_storage::StateStore;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub assets: Arc<AssetLedger>,
    pub bundles: Arc<BundlePublisher>,
    pub config: Arc<Config>,
}
