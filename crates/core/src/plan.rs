//! The rollout plan: which objects to apply, in what order, and what
//! "done" looks like for each of them. Produced by a renderer, consumed
//! read-only by the rollout engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duration::PlanDuration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: RolloutSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    #[serde(default)]
    pub parallel: bool,
    pub groups: Vec<RolloutGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutGroup {
    pub name: String,
    #[serde(default)]
    pub parallel: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Key into the renderer's object map.
    pub object: String,
    /// Name of a registered object action.
    pub action: String,
    #[serde(default)]
    pub success: Vec<SuccessDefinition>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Step {
    /// Display name for logs: the explicit step name, falling back to the
    /// object key.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.object)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_comparisons: Option<FieldComparisons>,
    #[serde(default)]
    pub failure: Vec<FailureDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldComparisons {
    #[serde(default)]
    pub expected_values: Vec<ExpectedValue>,
    #[serde(default = "PlanDuration::default_timeout")]
    pub timeout: PlanDuration,
    #[serde(default = "PlanDuration::default_progress_timeout")]
    pub progress_timeout: PlanDuration,
    #[serde(default = "PlanDuration::default_poll_interval")]
    pub poll_interval: PlanDuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_timeout: Option<ReportConfig>,
    #[serde(default)]
    pub failure: Vec<FailureDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedValue {
    pub name: String,
    /// JSONPath into the live object.
    pub path: String,
    /// Substitute when the path yields no result at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub value: ExpectedValueSource,
}

/// Where the expected side of a comparison comes from. Presence precedence
/// is path, then static, then staticInt64.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedValueSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(
        rename = "static",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub static_value: Option<Value>,
    #[serde(
        rename = "staticInt64",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub static_int64: Option<i64>,
}

impl ExpectedValueSource {
    /// Resolve the static side, applying the static/staticInt64 precedence.
    pub fn static_expected(&self) -> Value {
        match (&self.static_value, self.static_int64) {
            (Some(v), _) => v.clone(),
            (None, Some(i)) => Value::from(i),
            (None, None) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDefinition {
    /// Name of a registered failure check.
    pub check_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseReportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseReportConfig {
    #[serde(rename = "name")]
    pub database_name: String,
    pub query: DatabaseReportQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseReportQuery {
    pub stmt: String,
}
