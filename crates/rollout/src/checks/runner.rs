//! The polling state machine behind a field-comparison success check.
//!
//! Two nested loops: the outer one runs until the overall timeout, the inner
//! one until the progress timeout. The inner loop escapes back to the outer
//! loop only when the observed values change between samples; standing still
//! for a whole progress window counts as a timeout even if the overall
//! timeout is further out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::debug;

use capstan_client::{Cluster, ResourceOps};
use capstan_core::path::PathEvaluator;
use capstan_core::plan::{ExpectedValue, FailureDefinition, FieldComparisons};
use capstan_core::unstructured;

use super::{FailureCheck, Reporter};

/// One comparison verdict, kept for debug logging.
struct CheckReport {
    check_name: String,
    message: String,
}

enum PollOutcome {
    Matched,
    /// A classified failure was reported to the side channel; the step is
    /// treated as succeeded.
    Reported,
    TimedOut,
}

pub struct CheckRunner {
    cluster: Arc<dyn Cluster>,
    fc: FieldComparisons,
    failure: Vec<FailureDefinition>,
    paths: HashMap<String, PathEvaluator>,
    known_checks: HashMap<String, Arc<dyn FailureCheck>>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl CheckRunner {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        fc: &FieldComparisons,
        failure: &[FailureDefinition],
        known_checks: &HashMap<String, Arc<dyn FailureCheck>>,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Result<Self> {
        let mut paths = HashMap::new();
        for ev in &fc.expected_values {
            paths.insert(
                ev.path.clone(),
                PathEvaluator::compile(&ev.path, ev.default.clone())?,
            );
            if let Some(value_path) = &ev.value.path {
                paths.insert(value_path.clone(), PathEvaluator::compile(value_path, None)?);
            }
        }

        // failure definitions attach at both the success definition and the
        // field comparison level
        let mut all_failure = failure.to_vec();
        all_failure.extend(fc.failure.iter().cloned());

        Ok(CheckRunner {
            cluster,
            fc: fc.clone(),
            failure: all_failure,
            paths,
            known_checks: known_checks.clone(),
            reporter,
        })
    }

    pub async fn execute(&self, object: &Value) -> Result<()> {
        let name = unstructured::name(object).to_string();
        let namespace = unstructured::namespace(object).to_string();
        debug!(%name, %namespace, "starting field comparison success check");

        let ops = self
            .cluster
            .ops_for_object(object)
            .await
            .context("failed to get client for object")?;

        let outcome = self.poll(ops.as_ref(), &name, object).await?;
        match outcome {
            PollOutcome::Matched => {
                debug!(%name, %namespace, "field comparison success check successful");
                Ok(())
            }
            PollOutcome::Reported => Ok(()),
            PollOutcome::TimedOut => match &self.fc.report_timeout {
                Some(report) => {
                    let reporter = self
                        .reporter
                        .as_ref()
                        .ok_or_else(|| anyhow!("no reporter configured to dispatch timeout report"))?;
                    reporter
                        .report(report)
                        .await
                        .context("failed to report timeout")
                }
                None => Err(anyhow!(
                    "timed out waiting for success of {}/{}",
                    namespace,
                    name
                )),
            },
        }
    }

    async fn poll(&self, ops: &dyn ResourceOps, name: &str, object: &Value) -> Result<PollOutcome> {
        let interval = self.fc.poll_interval.0;
        let deadline = Instant::now() + self.fc.timeout.0;

        loop {
            if Instant::now() >= deadline {
                return Ok(PollOutcome::TimedOut);
            }
            sleep(interval).await;

            let outer_values = self
                .current_values(ops, name)
                .await
                .context("failed to extract periodic status information")?;
            if self.compare_and_log(name, &outer_values) {
                return Ok(PollOutcome::Matched);
            }
            if let Some(outcome) = self
                .run_failure_checks(object)
                .await
                .context("check if rollout failed")?
            {
                return Ok(outcome);
            }

            let progress_deadline = Instant::now() + self.fc.progress_timeout.0;
            loop {
                if Instant::now() >= progress_deadline {
                    // no progress for a whole window
                    return Ok(PollOutcome::TimedOut);
                }
                sleep(interval).await;

                let inner_values = self
                    .current_values(ops, name)
                    .await
                    .context("failed to extract updated status information")?;
                if self.compare_and_log(name, &inner_values) {
                    return Ok(PollOutcome::Matched);
                }
                if let Some(outcome) = self
                    .run_failure_checks(object)
                    .await
                    .context("check if rollout failed")?
                {
                    return Ok(outcome);
                }

                let has_changed = inner_values != outer_values;
                debug!(%name, has_changed, "checked whether observed fields have changed");
                if has_changed {
                    break;
                }
            }
        }
    }

    async fn current_values(
        &self,
        ops: &dyn ResourceOps,
        name: &str,
    ) -> Result<BTreeMap<String, Value>> {
        let live = ops
            .get_opt(name)
            .await?
            .ok_or_else(|| anyhow!("object {:?} not found", name))?;

        let mut values = BTreeMap::new();
        for (expr, evaluator) in &self.paths {
            values.insert(expr.clone(), evaluator.eval(&live)?);
        }
        Ok(values)
    }

    fn compare_and_log(&self, name: &str, values: &BTreeMap<String, Value>) -> bool {
        let (success, reports) = self.check_comparisons(values);
        for report in reports {
            debug!(%name, check = %report.check_name, message = %report.message);
        }
        success
    }

    fn check_comparisons(&self, values: &BTreeMap<String, Value>) -> (bool, Vec<CheckReport>) {
        let mut success = true;
        let mut reports = Vec::with_capacity(self.fc.expected_values.len());
        for ev in &self.fc.expected_values {
            let (ok, report) = self.check_field_comparison(ev, values);
            success &= ok;
            reports.push(report);
        }
        (success, reports)
    }

    fn check_field_comparison(
        &self,
        ev: &ExpectedValue,
        values: &BTreeMap<String, Value>,
    ) -> (bool, CheckReport) {
        let observed = values.get(&ev.path).cloned().unwrap_or(Value::Null);

        // a dynamic path takes precedence over static values
        let (expected, expected_desc) = match &ev.value.path {
            Some(path) => {
                let v = values.get(path).cloned().unwrap_or(Value::Null);
                (v.clone(), format!("dynamic value of {} = {}", path, v))
            }
            None => {
                let v = ev.value.static_expected();
                (v.clone(), format!("static value of {}", v))
            }
        };

        let eq = observed == expected;
        let message = format!(
            "field comparison {}: observed {} = {}; expected {}",
            if eq { "succeeded" } else { "failed" },
            ev.path,
            observed,
            expected_desc
        );
        (
            eq,
            CheckReport {
                check_name: ev.name.clone(),
                message,
            },
        )
    }

    async fn run_failure_checks(&self, object: &Value) -> Result<Option<PollOutcome>> {
        for fd in &self.failure {
            let check = self
                .known_checks
                .get(&fd.check_name)
                .ok_or_else(|| anyhow!("unknown failure check {:?}", fd.check_name))?;

            debug!(
                name = unstructured::name(object),
                check = %fd.check_name,
                "running failure check"
            );
            if let Err(err) = check.execute(self.cluster.as_ref(), object).await {
                debug!(
                    name = unstructured::name(object),
                    check = %fd.check_name,
                    err = %format!("{:#}", err),
                    "failure check failed"
                );
                if let Some(report) = &fd.report {
                    if check.is_failed_error(&err) {
                        let reporter = self.reporter.as_ref().ok_or_else(|| {
                            anyhow!("no reporter configured to dispatch failure report")
                        })?;
                        reporter
                            .report(report)
                            .await
                            .context("failed to report failure")?;
                        return Ok(Some(PollOutcome::Reported));
                    }
                }
                return Err(err.context(format!("run failure check {:?}", fd.check_name)));
            }
        }
        Ok(None)
    }
}
