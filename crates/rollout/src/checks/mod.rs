//! Success and failure checks: the registry of named failure predicates and
//! the per-step success check dispatch.

mod job_oom;
mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use capstan_client::Cluster;
use capstan_core::plan::{ReportConfig, SuccessDefinition};

pub use job_oom::{JobCheckError, JobOomKilledCheck};
pub use runner::CheckRunner;

/// A named predicate that classifies an object as definitively failed.
#[async_trait]
pub trait FailureCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns an error when the object is in a failed state, or when the
    /// check itself cannot run.
    async fn execute(&self, cluster: &dyn Cluster, object: &Value) -> Result<()>;

    /// Whether an error from `execute` means "definitively failed" as
    /// opposed to "could not tell".
    fn is_failed_error(&self, err: &anyhow::Error) -> bool;
}

/// Side channel invoked on timeouts and classified failures.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, config: &ReportConfig) -> Result<()>;
}

pub fn default_checks() -> Vec<Arc<dyn FailureCheck>> {
    vec![Arc::new(JobOomKilledCheck)]
}

/// Runs the success definitions of a step, one after the other.
pub struct SuccessChecks {
    cluster: Arc<dyn Cluster>,
    known_checks: HashMap<String, Arc<dyn FailureCheck>>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl SuccessChecks {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        checks: Vec<Arc<dyn FailureCheck>>,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Result<Self> {
        let mut known_checks: HashMap<String, Arc<dyn FailureCheck>> = HashMap::new();
        for check in checks {
            let name = check.name();
            if known_checks.insert(name.to_string(), check).is_some() {
                bail!("duplicate failure check name: {}", name);
            }
        }
        Ok(SuccessChecks {
            cluster,
            known_checks,
            reporter,
        })
    }

    pub async fn run_checks(&self, defs: &[SuccessDefinition], object: &Value) -> Result<()> {
        for def in defs {
            self.run_check(def, object).await?;
        }
        Ok(())
    }

    async fn run_check(&self, def: &SuccessDefinition, object: &Value) -> Result<()> {
        let Some(fc) = &def.field_comparisons else {
            debug!("success definition has no field comparisons, skipping");
            return Ok(());
        };
        let runner = CheckRunner::new(
            self.cluster.clone(),
            fc,
            &def.failure,
            &self.known_checks,
            self.reporter.clone(),
        )?;
        runner.execute(object).await
    }
}
