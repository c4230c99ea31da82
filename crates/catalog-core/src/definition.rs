//! Workflow definitions and their compiled DAG metadata (`spec.md` §3, §4.1).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::Step;
use crate::trigger::TriggerSpec;

/// Derived, compiler-produced graph metadata for a definition. Never
/// hand-authored; always recomputed by `catalog-dag::compile`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DagMetadata {
    /// Step ids with no dependencies.
    pub roots: Vec<String>,
    /// Stable topological order (depth ASC, stepId ASC tie-break).
    pub order: Vec<String>,
    /// from -> [to, ...]
    pub adjacency: HashMap<String, Vec<String>>,
    /// to -> [from, ...]
    pub reverse_adjacency: HashMap<String, Vec<String>>,
    /// stepId -> depth (longest path from a root).
    pub depth: HashMap<String, u32>,
    /// fan-out template step id -> its parent fan-out step id.
    pub fanout_templates: HashMap<String, String>,
}

/// A workflow definition: slug + version addressable, owns its steps and
/// asset declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: uuid::Uuid,
    pub slug: String,
    pub name: String,
    pub version: i64,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub parameters_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub default_parameters: serde_json::Value,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub dag: DagMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}
