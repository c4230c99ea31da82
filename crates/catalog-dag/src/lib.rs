//! DAG validation and compilation (`spec.md` §4.1).
//!
//! `validate_and_compile` takes the raw `Step` list as parsed from a
//! definition payload and produces a normalized `Step` list plus
//! `DagMetadata`, or rejects it with a `DagError` carrying a specific
//! `DagErrorKind`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use catalog_core::{AssetId, DagMetadata, Partitioning, Step, StepKind};
use serde::{Deserialize, Serialize};

/// The specific validation failures the compiler can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagErrorKind {
    DuplicateId,
    UnknownDependency,
    Cycle,
    FanoutTemplateIdConflict,
    InvalidAssetId,
    ConflictingPartitioning,
}

/// A DAG compilation failure, with a detail payload a caller can surface
/// to an operator (offending ids, the cycle witness, etc).
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct DagError {
    pub kind: DagErrorKind,
    pub detail: String,
    #[serde(default)]
    pub step_ids: Vec<String>,
}

impl DagError {
    fn new(kind: DagErrorKind, detail: impl Into<String>, step_ids: Vec<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            step_ids,
        }
    }
}

impl From<DagError> for catalog_core::EngineError {
    fn from(err: DagError) -> Self {
        catalog_core::EngineError::validation(err.detail.clone()).with_detail(serde_json::json!({
            "dagErrorKind": err.kind,
            "stepIds": err.step_ids,
        }))
    }
}

/// Validate and compile a raw step list into a normalized step list plus
/// its `DagMetadata`.
pub fn validate_and_compile(steps: Vec<Step>) -> Result<(Vec<Step>, DagMetadata), DagError> {
    let normalized: Vec<Step> = steps.into_iter().map(normalize_step).collect();

    // Build the full id namespace: real steps plus fan-out templates, whose
    // ids live in the same namespace (`spec.md` §4.1).
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut template_parent: HashMap<String, String> = HashMap::new();
    for step in &normalized {
        check_unique_id(&step.id, &mut seen_ids, DagErrorKind::DuplicateId)?;
        if let StepKind::FanOut(fan_out) = &step.kind {
            check_unique_id(
                &fan_out.template.id,
                &mut seen_ids,
                DagErrorKind::FanoutTemplateIdConflict,
            )?;
            template_parent.insert(fan_out.template.id.clone(), step.id.clone());
        }
    }

    // Validate dependsOn references resolve within the real-step namespace
    // (templates are not legal dependency targets — only their fan-out
    // parent is addressable from sibling steps).
    let real_ids: HashSet<&str> = normalized.iter().map(|s| s.id.as_str()).collect();
    for step in &normalized {
        for dep in &step.depends_on {
            if !real_ids.contains(dep.as_str()) {
                return Err(DagError::new(
                    DagErrorKind::UnknownDependency,
                    format!("step '{}' depends on unknown step '{dep}'", step.id),
                    vec![step.id.clone(), dep.clone()],
                ));
            }
        }
    }

    validate_asset_declarations(&normalized)?;

    let dag = compile_dag(&normalized, &template_parent)?;

    Ok((normalized, dag))
}

fn check_unique_id(
    id: &str,
    seen: &mut HashSet<String>,
    kind_if_duplicate: DagErrorKind,
) -> Result<(), DagError> {
    if !seen.insert(id.to_string()) {
        return Err(DagError::new(
            kind_if_duplicate,
            format!("duplicate step id '{id}'"),
            vec![id.to_string()],
        ));
    }
    Ok(())
}

/// Trim ids, dedupe `dependsOn`, lower-case service/job slugs.
fn normalize_step(mut step: Step) -> Step {
    step.id = step.id.trim().to_string();
    let mut seen = BTreeSet::new();
    step.depends_on.retain(|dep| seen.insert(dep.trim().to_string()));
    step.depends_on = step.depends_on.iter().map(|d| d.trim().to_string()).collect();

    match &mut step.kind {
        StepKind::Job(job) => {
            job.job_slug = job.job_slug.trim().to_lowercase();
            if let Some(binding) = &mut job.bundle {
                binding.slug = binding.slug.trim().to_lowercase();
            }
        }
        StepKind::Service(service) => {
            service.service_slug = service.service_slug.trim().to_lowercase();
        }
        StepKind::FanOut(fan_out) => {
            let template = std::mem::replace(
                &mut fan_out.template,
                Box::new(dummy_template_placeholder()),
            );
            fan_out.template = Box::new(normalize_step(*template));
        }
    }
    step
}

fn dummy_template_placeholder() -> Step {
    // Only used as a transient swap target inside `normalize_step`; never
    // observed by callers.
    Step {
        id: String::new(),
        name: String::new(),
        description: None,
        depends_on: Vec::new(),
        retry_policy: None,
        asset_declarations: Vec::new(),
        kind: StepKind::Job(catalog_core::JobStep {
            job_slug: String::new(),
            bundle: None,
            timeout_ms: None,
        }),
    }
}

fn validate_asset_declarations(steps: &[Step]) -> Result<(), DagError> {
    let mut partitioning_by_asset: HashMap<String, Partitioning> = HashMap::new();
    for step in steps {
        for decl in &step.asset_declarations {
            AssetId::parse(decl.asset_id.as_str()).map_err(|e| {
                DagError::new(
                    DagErrorKind::InvalidAssetId,
                    e.message,
                    vec![step.id.clone()],
                )
            })?;
            if let Some(partitioning) = &decl.partitioning {
                match partitioning_by_asset.get(decl.asset_id.as_str()) {
                    Some(existing) if existing != partitioning => {
                        return Err(DagError::new(
                            DagErrorKind::ConflictingPartitioning,
                            format!(
                                "asset '{}' declared with conflicting partitioning schemes",
                                decl.asset_id
                            ),
                            vec![step.id.clone()],
                        ));
                    }
                    _ => {
                        partitioning_by_asset
                            .insert(decl.asset_id.as_str().to_string(), partitioning.clone());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Kahn-style layered topological sort. Each layer is the set of nodes
/// whose dependencies are all already placed; within a layer nodes are
/// emitted in stepId order, giving a stable `(depth ASC, stepId ASC)`
/// tie-break. Fan-out templates are appended as
/// depth-(parent+1) nodes with an edge from their fan-out parent, but do
/// not participate in dependency resolution for other steps.
fn compile_dag(
    steps: &[Step],
    template_parent: &HashMap<String, String>,
) -> Result<DagMetadata, DagError> {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut in_degree: HashMap<String, usize> = HashMap::new();

    for step in steps {
        adjacency.entry(step.id.clone()).or_default();
        in_degree.entry(step.id.clone()).or_insert(0);
        for dep in &step.depends_on {
            adjacency.entry(dep.clone()).or_default().push(step.id.clone());
            reverse_adjacency
                .entry(step.id.clone())
                .or_default()
                .push(dep.clone());
            *in_degree.entry(step.id.clone()).or_insert(0) += 1;
        }
    }

    let mut depth: HashMap<String, u32> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut roots: Vec<String> = Vec::new();

    let mut frontier: Vec<String> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();
    frontier.sort();
    roots = frontier.clone();

    let mut remaining = in_degree.clone();
    let mut queue: VecDeque<String> = frontier.into_iter().collect();
    for id in &queue {
        depth.insert(id.clone(), 0);
    }

    while !queue.is_empty() {
        let mut layer: Vec<String> = queue.drain(..).collect();
        layer.sort();
        for id in &layer {
            order.push(id.clone());
        }
        let mut next_layer: Vec<String> = Vec::new();
        for id in &layer {
            let current_depth = depth[id];
            if let Some(children) = adjacency.get(id) {
                for child in children {
                    let deg = remaining.get_mut(child).expect("child tracked in-degree");
                    *deg -= 1;
                    if *deg == 0 {
                        next_layer.push(child.clone());
                        depth.insert(child.clone(), current_depth + 1);
                    }
                }
            }
        }
        next_layer.sort();
        next_layer.dedup();
        for id in next_layer {
            queue.push_back(id);
        }
    }

    if order.len() != steps.len() {
        let cycle_witness: Vec<String> = remaining
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id)
            .collect();
        let mut cycle_witness = cycle_witness;
        cycle_witness.sort();
        return Err(DagError::new(
            DagErrorKind::Cycle,
            "workflow definition contains a cycle",
            cycle_witness,
        ));
    }

    // Append fan-out templates: depth = parent depth + 1, edge parent -> template.
    let mut fanout_templates = HashMap::new();
    let mut template_ids: Vec<&String> = template_parent.keys().collect();
    template_ids.sort();
    for template_id in template_ids {
        let parent_id = &template_parent[template_id];
        let parent_depth = *depth.get(parent_id).unwrap_or(&0);
        depth.insert(template_id.clone(), parent_depth + 1);
        adjacency
            .entry(parent_id.clone())
            .or_default()
            .push(template_id.clone());
        reverse_adjacency
            .entry(template_id.clone())
            .or_default()
            .push(parent_id.clone());
        order.push(template_id.clone());
        fanout_templates.insert(template_id.clone(), parent_id.clone());
    }

    Ok(DagMetadata {
        roots,
        order,
        adjacency,
        reverse_adjacency,
        depth,
        fanout_templates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{AssetDeclaration, AssetDirection, FanOutStep, JobStep};

    fn job_step(id: &str, depends_on: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            retry_policy: None,
            asset_declarations: Vec::new(),
            kind: StepKind::Job(JobStep {
                job_slug: format!("JOB_{id}"),
                bundle: None,
                timeout_ms: None,
            }),
        }
    }

    #[test]
    fn linear_chain_compiles_in_order() {
        let steps = vec![job_step("a", &[]), job_step("b", &["a"]), job_step("c", &["b"])];
        let (normalized, dag) = validate_and_compile(steps).unwrap();
        assert_eq!(dag.order, vec!["a", "b", "c"]);
        assert_eq!(dag.roots, vec!["a"]);
        assert_eq!(dag.depth["c"], 2);
        // job slugs are lower-cased during normalization
        assert!(matches!(&normalized[0].kind, StepKind::Job(j) if j.job_slug == "job_a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let steps = vec![job_step("a", &["missing"])];
        let err = validate_and_compile(steps).unwrap_err();
        assert_eq!(err.kind, DagErrorKind::UnknownDependency);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let steps = vec![job_step("a", &[]), job_step("a", &[])];
        let err = validate_and_compile(steps).unwrap_err();
        assert_eq!(err.kind, DagErrorKind::DuplicateId);
    }

    #[test]
    fn cycle_is_rejected_with_witness() {
        let steps = vec![job_step("a", &["b"]), job_step("b", &["a"])];
        let err = validate_and_compile(steps).unwrap_err();
        assert_eq!(err.kind, DagErrorKind::Cycle);
        assert_eq!(err.step_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn diamond_has_stable_tie_break_order() {
        // a -> b, a -> c, b -> d, c -> d : b and c tie at depth 1, ordered by id.
        let steps = vec![
            job_step("a", &[]),
            job_step("c", &["a"]),
            job_step("b", &["a"]),
            job_step("d", &["b", "c"]),
        ];
        let (_, dag) = validate_and_compile(steps).unwrap();
        assert_eq!(dag.order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn fanout_template_id_must_be_unique() {
        let template = job_step("child", &[]);
        let fan_out = Step {
            id: "fan".to_string(),
            name: "fan".to_string(),
            description: None,
            depends_on: vec![],
            retry_policy: None,
            asset_declarations: Vec::new(),
            kind: StepKind::FanOut(FanOutStep {
                collection: "$.items".to_string(),
                template: Box::new(template),
                max_items: Some(10),
                max_concurrency: Some(2),
                store_results_as: None,
            }),
        };
        let steps = vec![fan_out, job_step("child", &[])];
        let err = validate_and_compile(steps).unwrap_err();
        assert_eq!(err.kind, DagErrorKind::FanoutTemplateIdConflict);
    }

    #[test]
    fn fanout_template_is_placed_one_depth_below_parent() {
        let template = job_step("child", &[]);
        let fan_out = Step {
            id: "fan".to_string(),
            name: "fan".to_string(),
            description: None,
            depends_on: vec!["a".to_string()],
            retry_policy: None,
            asset_declarations: Vec::new(),
            kind: StepKind::FanOut(FanOutStep {
                collection: "$.items".to_string(),
                template: Box::new(template),
                max_items: Some(10),
                max_concurrency: Some(2),
                store_results_as: None,
            }),
        };
        let steps = vec![job_step("a", &[]), fan_out];
        let (_, dag) = validate_and_compile(steps).unwrap();
        assert_eq!(dag.depth["fan"], 1);
        assert_eq!(dag.depth["child"], 2);
        assert_eq!(dag.fanout_templates["child"], "fan");
    }

    #[test]
    fn invalid_asset_id_is_rejected() {
        let mut step = job_step("a", &[]);
        step.asset_declarations.push(AssetDeclaration {
            step_id: "a".to_string(),
            direction: AssetDirection::Produces,
            asset_id: catalog_core::AssetId::parse("placeholder").unwrap(),
            asset_schema: None,
            freshness: None,
            auto_materialize: None,
            partitioning: None,
        });
        // Force an invalid id past construction via direct field mutation
        // is not possible (AssetId validates on parse), so this test
        // exercises the compiler's own re-validation path using a
        // deliberately malformed raw string via serde round-trip instead.
        let raw = serde_json::json!({"stepId": "a", "direction": "produces", "assetId": " bad id"});
        let parsed: Result<AssetDeclaration, _> = serde_json::from_value(raw);
        assert!(parsed.is_ok()); // AssetId is transparent, so deserialize doesn't validate...
        let mut bad_step = job_step("b", &[]);
        if let Ok(decl) = parsed {
            bad_step.asset_declarations.push(decl);
        }
        let steps = vec![step, bad_step];
        let err = validate_and_compile(steps).unwrap_err();
        assert_eq!(err.kind, DagErrorKind::InvalidAssetId);
    }

    #[test]
    fn conflicting_partitioning_is_rejected() {
        use catalog_core::{Granularity, Partitioning};
        let mut a = job_step("a", &[]);
        a.asset_declarations.push(AssetDeclaration {
            step_id: "a".to_string(),
            direction: AssetDirection::Produces,
            asset_id: catalog_core::AssetId::parse("sales").unwrap(),
            asset_schema: None,
            freshness: None,
            auto_materialize: None,
            partitioning: Some(Partitioning::Static {
                keys: vec!["us".to_string()],
            }),
        });
        let mut b = job_step("b", &[]);
        b.asset_declarations.push(AssetDeclaration {
            step_id: "b".to_string(),
            direction: AssetDirection::Produces,
            asset_id: catalog_core::AssetId::parse("sales").unwrap(),
            asset_schema: None,
            freshness: None,
            auto_materialize: None,
            partitioning: Some(Partitioning::TimeWindow {
                granularity: Granularity::Day,
                timezone: None,
                format: Some("YYYY-MM-DD".to_string()),
                lookback_windows: None,
            }),
        });
        let err = validate_and_compile(vec![a, b]).unwrap_err();
        assert_eq!(err.kind, DagErrorKind::ConflictingPartitioning);
    }
}
