//! Step variants that make up a workflow definition (`spec.md` §3 `Step`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::asset::AssetDeclaration;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};

/// Bundle resolution strategy for a Job step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStrategy {
    /// Resolved to the highest published version at **run creation time**
    /// (see Open Question resolution in DESIGN.md).
    Latest,
    Pinned,
}

/// How a Job step binds to a published job bundle artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleBinding {
    pub strategy: BundleStrategy,
    pub slug: String,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub export_name: Option<String>,
}

/// A step that runs an externally supplied job bundle handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    pub job_slug: String,
    #[serde(default)]
    pub bundle: Option<BundleBinding>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// HTTP-style request template for a Service step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequestTemplate {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// Health gating and response-capture flags for a Service step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPolicy {
    #[serde(default)]
    pub require_healthy: bool,
    #[serde(default)]
    pub allow_degraded: bool,
    #[serde(default)]
    pub capture_response: bool,
    #[serde(default)]
    pub store_response_as: Option<String>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            require_healthy: false,
            allow_degraded: true,
            capture_response: false,
            store_response_as: None,
            circuit_breaker: None,
        }
    }
}

/// A step that calls a service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStep {
    pub service_slug: String,
    pub request: ServiceRequestTemplate,
    #[serde(default)]
    pub health_policy: HealthPolicy,
}

/// A step that expands a collection into N templated children.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutStep {
    /// JSON-path-like expression over parameters/context/prior outputs.
    pub collection: String,
    pub template: Box<Step>,
    #[serde(default)]
    pub max_items: Option<u32>,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub store_results_as: Option<String>,
}

/// Discriminated step variant (`spec.md` §3: Job | Service | FanOut).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Job(JobStep),
    Service(ServiceStep),
    FanOut(FanOutStep),
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub asset_declarations: Vec<AssetDeclaration>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn is_fan_out(&self) -> bool {
        matches!(self.kind, StepKind::FanOut(_))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}
