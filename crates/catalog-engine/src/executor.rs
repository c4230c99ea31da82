//! Step executor: runs one attempt of a Job or Service step, and evaluates
//! a FanOut step's collection into child rows (`spec.md` §4.3).
//!
//! Job bundles are externally supplied code (§1 Non-goals put their build
//! and launch out of scope); this module only owns the contract a handler
//! is invoked through. [`JobHandlerRegistry`] plays the same role here that
//! `everruns-durable::engine::registry::WorkflowRegistry` plays for
//! workflow types: a type-erased map from a slug to a boxed implementation,
//! looked up at dispatch time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_core::{
    CircuitBreakerConfig, CircuitState, EngineError, ErrorKind, FailureReason, HealthPolicy,
    ServiceRequestTemplate, Step, StepKind, WorkflowRunStep,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use catalog_storage::StateStore;

/// Minimum interval between heartbeat writes (`spec.md` §4.3).
const HEARTBEAT_MIN_INTERVAL_MS: i64 = 5_000;

/// One produced asset surfaced by a job handler, recorded through the
/// Asset Ledger by the orchestrator in the same completion as the step.
#[derive(Debug, Clone)]
pub struct ProducedAsset {
    pub asset_id: String,
    pub partition_key: Option<String>,
    pub payload: Option<Value>,
}

/// Result of a successful job handler invocation.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub output: Option<Value>,
    pub produced_assets: Vec<ProducedAsset>,
}

/// Throttled heartbeat callback passed to a job handler, mirroring the
/// `heartbeat()` contract in `spec.md` §4.3: at most one write per 5s.
pub struct HeartbeatHandle {
    store: Arc<dyn StateStore>,
    step_id: Uuid,
    claim_owner: String,
    last_sent_ms: AtomicI64,
}

impl HeartbeatHandle {
    fn new(store: Arc<dyn StateStore>, step_id: Uuid, claim_owner: String) -> Self {
        Self {
            store,
            step_id,
            claim_owner,
            last_sent_ms: AtomicI64::new(0),
        }
    }

    /// Writes a heartbeat if at least 5s have elapsed since the last one;
    /// otherwise a no-op. Safe to call as often as a handler likes.
    pub async fn beat(&self) -> Result<(), EngineError> {
        let now_ms = Utc::now().timestamp_millis();
        let last = self.last_sent_ms.load(Ordering::Relaxed);
        if now_ms - last < HEARTBEAT_MIN_INTERVAL_MS {
            return Ok(());
        }
        self.last_sent_ms.store(now_ms, Ordering::Relaxed);
        self.store.heartbeat_step(self.step_id, &self.claim_owner).await?;
        Ok(())
    }
}

/// Everything a job handler needs for one attempt.
pub struct JobContext<'a> {
    pub parameters: &'a Value,
    pub context: &'a Value,
    pub attempt_token: String,
    pub heartbeat: HeartbeatHandle,
}

/// A registered job bundle handler. The bundle artifact itself (fetched
/// and checksum-verified via [`crate::BundlePublisher`]) is out of this
/// trait's scope; this is the seam the resolved bundle's entry point is
/// invoked through once loaded.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext<'_>) -> Result<JobOutcome, EngineError>;
}

/// Type-erased map from `jobSlug` to its handler, the job-step analogue of
/// a workflow registry in a durable executor.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_slug: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_slug.into().to_lowercase(), handler);
    }

    pub fn get(&self, job_slug: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_slug.to_lowercase()).cloned()
    }
}

/// Resolved location and last-known health of a service endpoint.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub base_url: String,
    pub healthy: bool,
    pub degraded: bool,
}

/// Resolves a `serviceSlug` to its current endpoint and health snapshot.
/// Service launch/registration is out of scope (`spec.md` §1); this is the
/// interface boundary to that external collaborator.
#[async_trait]
pub trait ServiceResolver: Send + Sync + 'static {
    async fn resolve(&self, service_slug: &str) -> Result<ServiceEndpoint, EngineError>;
}

/// Resolves services from `APPHUB_SERVICE_<SLUG>_URL` environment
/// variables, treating every resolved endpoint as healthy unless
/// `APPHUB_SERVICE_<SLUG>_DEGRADED=true` is set. A reasonable default for
/// a single-process deployment; production topologies supply their own
/// resolver backed by the service registry.
#[derive(Debug, Default)]
pub struct EnvServiceResolver;

#[async_trait]
impl ServiceResolver for EnvServiceResolver {
    async fn resolve(&self, service_slug: &str) -> Result<ServiceEndpoint, EngineError> {
        let key = service_slug.to_uppercase().replace(['-', '.'], "_");
        let base_url = std::env::var(format!("APPHUB_SERVICE_{key}_URL")).map_err(|_| {
            EngineError::new(
                ErrorKind::Validation,
                format!("no endpoint configured for service '{service_slug}'"),
            )
        })?;
        let degraded = std::env::var(format!("APPHUB_SERVICE_{key}_DEGRADED"))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(ServiceEndpoint {
            base_url,
            healthy: !degraded,
            degraded,
        })
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<chrono::DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Per-service-slug circuit breakers for Service steps that opt into one
/// via `HealthPolicy::circuit_breaker` (ambient reliability addition, see
/// SPEC_FULL.md; mirrors `everruns-durable::reliability::CircuitBreaker`).
#[derive(Default)]
struct CircuitBreakers {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakers {
    fn allow(&self, slug: &str, config: &CircuitBreakerConfig) -> bool {
        let mut states = self.states.lock();
        let entry = states.entry(slug.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let reset_due = entry
                    .opened_at
                    .map(|opened| Utc::now() - opened >= chrono::Duration::milliseconds(config.reset_timeout_ms as i64))
                    .unwrap_or(true);
                if reset_due {
                    entry.state = CircuitState::HalfOpen;
                    entry.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    fn record(&self, slug: &str, config: &CircuitBreakerConfig, success: bool) {
        let mut states = self.states.lock();
        let entry = states.entry(slug.to_string()).or_default();
        if success {
            entry.consecutive_failures = 0;
            match entry.state {
                CircuitState::HalfOpen => {
                    entry.consecutive_successes += 1;
                    if entry.consecutive_successes >= config.success_threshold {
                        entry.state = CircuitState::Closed;
                        entry.opened_at = None;
                    }
                }
                _ => entry.state = CircuitState::Closed,
            }
        } else {
            entry.consecutive_successes = 0;
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= config.failure_threshold {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Utc::now());
            }
        }
    }
}

/// Outcome of one step attempt, before the orchestrator persists it.
pub enum AttemptOutcome {
    Succeeded { output: Option<Value>, produced_assets: Vec<ProducedAsset> },
    Failed { reason: FailureReason, message: String, retryable: bool },
}

/// Executes Job and Service step attempts. FanOut expansion (evaluating the
/// collection into child rows) is also driven from here since it shares no
/// I/O surface with the orchestrator's run-level ready-set computation.
pub struct StepExecutor {
    jobs: JobHandlerRegistry,
    services: Arc<dyn ServiceResolver>,
    http: reqwest::Client,
    breakers: CircuitBreakers,
}

impl StepExecutor {
    pub fn new(jobs: JobHandlerRegistry, services: Arc<dyn ServiceResolver>) -> Self {
        Self {
            jobs,
            services,
            http: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            breakers: CircuitBreakers::default(),
        }
    }

    /// Runs one attempt of `step` for `claimed`, which must already be
    /// claimed (`status = running`) by `claim_owner`.
    #[instrument(skip(self, store, step, claimed, parameters, context))]
    pub async fn attempt(
        &self,
        store: &Arc<dyn StateStore>,
        step: &Step,
        claimed: &WorkflowRunStep,
        claim_owner: &str,
        parameters: &Value,
        context: &Value,
    ) -> AttemptOutcome {
        let timeout_ms = match &step.kind {
            StepKind::Job(job) => job.timeout_ms,
            _ => None,
        };
        let attempt_future = self.attempt_inner(store, step, claimed, claim_owner, parameters, context);
        match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), attempt_future).await {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome::Failed {
                    reason: FailureReason::Timeout,
                    message: format!("step '{}' exceeded its {}ms timeout", step.id, ms),
                    retryable: true,
                },
            },
            None => attempt_future.await,
        }
    }

    async fn attempt_inner(
        &self,
        store: &Arc<dyn StateStore>,
        step: &Step,
        claimed: &WorkflowRunStep,
        claim_owner: &str,
        parameters: &Value,
        context: &Value,
    ) -> AttemptOutcome {
        match &step.kind {
            StepKind::Job(job) => {
                let Some(handler) = self.jobs.get(&job.job_slug) else {
                    return AttemptOutcome::Failed {
                        reason: FailureReason::Validation,
                        message: format!("no job handler registered for '{}'", job.job_slug),
                        retryable: false,
                    };
                };
                let ctx = JobContext {
                    parameters,
                    context,
                    attempt_token: claimed.attempt_token(),
                    heartbeat: HeartbeatHandle::new(store.clone(), claimed.id, claim_owner.to_string()),
                };
                match handler.handle(ctx).await {
                    Ok(outcome) => AttemptOutcome::Succeeded {
                        output: outcome.output,
                        produced_assets: outcome.produced_assets,
                    },
                    Err(err) => AttemptOutcome::Failed {
                        reason: failure_reason_for(err.kind),
                        message: err.message,
                        retryable: err.is_retryable(),
                    },
                }
            }
            StepKind::Service(service) => {
                self.attempt_service(&service.service_slug, &service.request, &service.health_policy).await
            }
            StepKind::FanOut(_) => AttemptOutcome::Failed {
                reason: FailureReason::Unknown,
                message: "fan-out steps are expanded by the orchestrator, not attempted directly".to_string(),
                retryable: false,
            },
        }
    }

    async fn attempt_service(
        &self,
        service_slug: &str,
        request: &ServiceRequestTemplate,
        health_policy: &HealthPolicy,
    ) -> AttemptOutcome {
        let endpoint = match self.services.resolve(service_slug).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                return AttemptOutcome::Failed {
                    reason: FailureReason::UpstreamUnavailable,
                    message: err.message,
                    retryable: err.is_retryable(),
                }
            }
        };

        if health_policy.require_healthy && !endpoint.healthy {
            return AttemptOutcome::Failed {
                reason: FailureReason::UpstreamUnavailable,
                message: format!("service '{service_slug}' is not healthy"),
                retryable: true,
            };
        }
        if endpoint.degraded && !health_policy.allow_degraded {
            return AttemptOutcome::Failed {
                reason: FailureReason::UpstreamUnavailable,
                message: format!("service '{service_slug}' is degraded and degraded calls are disallowed"),
                retryable: true,
            };
        }

        if let Some(breaker) = &health_policy.circuit_breaker {
            if !self.breakers.allow(service_slug, breaker) {
                return AttemptOutcome::Failed {
                    reason: FailureReason::UpstreamUnavailable,
                    message: format!("circuit breaker open for service '{service_slug}'"),
                    retryable: true,
                };
            }
        }

        let url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut builder = self.http.request(method, &url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let result = builder.send().await;
        let outcome = match result {
            Ok(response) if response.status().is_success() => {
                let captured = if health_policy.capture_response {
                    response.json::<Value>().await.ok()
                } else {
                    None
                };
                AttemptOutcome::Succeeded {
                    output: captured,
                    produced_assets: Vec::new(),
                }
            }
            Ok(response) => {
                let status = response.status();
                AttemptOutcome::Failed {
                    reason: FailureReason::UpstreamUnavailable,
                    message: format!("service '{service_slug}' responded {status}"),
                    retryable: status.is_server_error(),
                }
            }
            Err(err) => AttemptOutcome::Failed {
                reason: if err.is_timeout() { FailureReason::Timeout } else { FailureReason::UpstreamUnavailable },
                message: err.to_string(),
                retryable: true,
            },
        };

        if let Some(breaker) = &health_policy.circuit_breaker {
            self.breakers.record(service_slug, breaker, matches!(outcome, AttemptOutcome::Succeeded { .. }));
        }

        outcome
    }
}

fn failure_reason_for(kind: ErrorKind) -> FailureReason {
    match kind {
        ErrorKind::Validation => FailureReason::Validation,
        ErrorKind::Transient => FailureReason::UpstreamUnavailable,
        ErrorKind::HeartbeatLost => FailureReason::HeartbeatLost,
        ErrorKind::Canceled => FailureReason::Canceled,
        ErrorKind::Fatal => FailureReason::HandlerError,
        ErrorKind::NotFound | ErrorKind::Conflict => FailureReason::Unknown,
    }
}

/// Evaluates a FanOut step's `collection` expression into a clipped list of
/// child inputs (`spec.md` §4.3). `collection` is either an inline JSON
/// array literal, or a dot-path (`parameters.items`, `context.items`,
/// `steps.<stepId>.items`) resolved against the run's parameters, context,
/// and prior step outputs.
pub fn evaluate_collection(
    collection: &str,
    parameters: &Value,
    context: &Value,
    step_outputs: &HashMap<String, Value>,
    max_items: Option<u32>,
) -> Result<Vec<Value>, EngineError> {
    let resolved = if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(collection) {
        items
    } else {
        let root = serde_json::json!({
            "parameters": parameters,
            "context": context,
            "steps": step_outputs,
        });
        let path = collection.strip_prefix("$.").unwrap_or(collection);
        let value = path
            .split('.')
            .try_fold(&root, |current, segment| current.get(segment))
            .cloned();
        match value {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(EngineError::validation(format!(
                    "fan-out collection '{collection}' did not resolve to an array"
                )))
            }
            None => {
                return Err(EngineError::validation(format!(
                    "fan-out collection '{collection}' did not resolve to a value"
                )))
            }
        }
    };

    let clipped = match max_items {
        Some(limit) => resolved.into_iter().take(limit as usize).collect(),
        None => resolved,
    };
    Ok(clipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_inline_array_literal_clipped_to_max_items() {
        let items = evaluate_collection(
            r#"[{"i":1},{"i":2},{"i":3}]"#,
            &Value::Null,
            &Value::Null,
            &HashMap::new(),
            Some(2),
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["i"], 1);
        assert_eq!(items[1]["i"], 2);
    }

    #[test]
    fn resolves_dot_path_against_parameters() {
        let parameters = serde_json::json!({"items": [1, 2, 3]});
        let items = evaluate_collection("parameters.items", &parameters, &Value::Null, &HashMap::new(), None).unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn non_array_resolution_is_a_validation_error() {
        let parameters = serde_json::json!({"items": "not-an-array"});
        let err = evaluate_collection("parameters.items", &parameters, &Value::Null, &HashMap::new(), None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn circuit_breaker_opens_after_failure_threshold() {
        let breakers = CircuitBreakers::default();
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout_ms: 60_000,
        };
        assert!(breakers.allow("svc", &config));
        breakers.record("svc", &config, false);
        assert!(breakers.allow("svc", &config));
        breakers.record("svc", &config, false);
        assert!(!breakers.allow("svc", &config));
    }
}
