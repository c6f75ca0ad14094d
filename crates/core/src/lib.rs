//! Capstan core types: the rollout plan data model, duration grammar,
//! untyped-tree accessors and JSONPath evaluation.

#![forbid(unsafe_code)]

pub mod duration;
pub mod path;
pub mod plan;
pub mod unstructured;

pub use duration::PlanDuration;
pub use path::PathEvaluator;
pub use plan::{
    DatabaseReportConfig, DatabaseReportQuery, ExpectedValue, ExpectedValueSource,
    FailureDefinition, FieldComparisons, Metadata, ReportConfig, Rollout, RolloutGroup,
    RolloutSpec, Step, SuccessDefinition,
};

pub mod prelude {
    pub use super::plan::{Rollout, RolloutGroup, Step, SuccessDefinition};
    pub use super::{PathEvaluator, PlanDuration};
}
