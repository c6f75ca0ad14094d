//! The rollout engine: renders a plan, then walks its groups in order,
//! running each step's action and success checks, and feeding group progress
//! back onto the owning resource.

#![forbid(unsafe_code)]

pub mod actions;
pub mod checks;
mod report;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, warn};

use capstan_client::Cluster;
use capstan_core::plan::Step;
use capstan_core::unstructured;
use capstan_feedback::{ConditionStatus, Feedback};
use capstan_render::{RenderResult, Renderer};

use actions::ObjectAction;
use checks::SuccessChecks;

/// Per-invocation input: the raw payload handed to the renderer plus an
/// optional feedback handle owned by this rollout.
#[derive(Clone, Default)]
pub struct RolloutConfig {
    pub raw_config: Option<Vec<u8>>,
    pub feedback: Option<Arc<dyn Feedback>>,
}

pub struct Runner {
    cluster: Arc<dyn Cluster>,
    renderer: Arc<dyn Renderer>,
    actions: HashMap<String, Arc<dyn ObjectAction>>,
    checks: Arc<SuccessChecks>,
    render_only: bool,
}

impl Runner {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        renderer: Arc<dyn Renderer>,
        checks: Arc<SuccessChecks>,
        render_only: bool,
    ) -> Self {
        Runner {
            cluster,
            renderer,
            actions: HashMap::new(),
            checks,
            render_only,
        }
    }

    pub fn set_object_actions(&mut self, actions: Vec<Arc<dyn ObjectAction>>) {
        for a in actions {
            self.actions.insert(a.name().to_string(), a);
        }
    }

    pub async fn execute(&self, config: Option<&RolloutConfig>) -> Result<()> {
        let started = Instant::now();
        let res = self.execute_inner(config).await;
        histogram!(
            "rollout_execution_duration_seconds",
            started.elapsed().as_secs_f64()
        );
        counter!("rollout_executions_total", 1u64);
        if res.is_err() {
            counter!("rollout_executions_failed_total", 1u64);
        }
        res
    }

    async fn execute_inner(&self, config: Option<&RolloutConfig>) -> Result<()> {
        let raw = config.and_then(|c| c.raw_config.as_deref());
        let rendered = self
            .renderer
            .render(raw)
            .await
            .context("failed to render")?;

        if self.render_only {
            let out = serde_json::to_string(&rendered).context("serializing render result")?;
            println!("{}", out);
            return Ok(());
        }

        let feedback = config.and_then(|c| c.feedback.as_ref());
        if let Some(feedback) = feedback {
            let groups: Vec<String> = rendered
                .rollout
                .spec
                .groups
                .iter()
                .map(|g| g.name.clone())
                .collect();
            feedback
                .initialize(&groups)
                .await
                .context("initialize feedback")?;
        }

        for group in &rendered.rollout.spec.groups {
            if group.parallel {
                self.run_parallel_group(&rendered, &group.name, &group.steps)
                    .await?;
            } else {
                for step in &group.steps {
                    if let Err(err) = self.run_step(&rendered, &group.name, step).await {
                        if step.continue_on_error {
                            debug!(
                                step = step.display_name(),
                                err = %format!("{:#}", err),
                                "step failed, but continuing"
                            );
                        } else {
                            return Err(err.context("run step"));
                        }
                    }
                }
            }

            if let Some(feedback) = feedback {
                feedback
                    .set_condition(&group.name, ConditionStatus::Finished)
                    .await?;
            }
        }

        Ok(())
    }

    async fn run_parallel_group(
        &self,
        rendered: &RenderResult,
        group_name: &str,
        steps: &[Step],
    ) -> Result<()> {
        let results = join_all(
            steps
                .iter()
                .map(|step| async move { (step, self.run_step(rendered, group_name, step).await) }),
        )
        .await;

        let mut failures = Vec::new();
        for (step, result) in results {
            if let Err(err) = result {
                if step.continue_on_error {
                    debug!(
                        step = step.display_name(),
                        err = %format!("{:#}", err),
                        "step failed, but continuing"
                    );
                } else {
                    failures.push(format!("{}: {:#}", step.display_name(), err));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to run steps: {}", failures.join("; ")))
        }
    }

    async fn run_step(
        &self,
        rendered: &RenderResult,
        group_name: &str,
        step: &Step,
    ) -> Result<()> {
        let object = rendered
            .objects
            .get(&step.object)
            .ok_or_else(|| anyhow!("could not find object named {:?}", step.object))?;

        debug!(
            group = group_name,
            action = %step.action,
            object = %step.object,
            "running action"
        );

        self.execute_action(&step.action, object)
            .await
            .with_context(|| format!("failed to execute action ({})", step.action))?;

        self.checks.run_checks(&step.success, object).await
    }

    async fn execute_action(&self, action_name: &str, object: &Value) -> Result<()> {
        if unstructured::is_list(object) {
            for item in unstructured::list_items(object) {
                self.execute_single_action(action_name, item).await?;
            }
            return Ok(());
        }
        self.execute_single_action(action_name, object).await
    }

    async fn execute_single_action(&self, action_name: &str, object: &Value) -> Result<()> {
        let action = self.actions.get(action_name).ok_or_else(|| {
            let mut available: Vec<&str> = self.actions.keys().map(String::as_str).collect();
            available.sort_unstable();
            anyhow!(
                "unknown action {:?}: available actions are {:?}",
                action_name,
                available
            )
        })?;

        let ops = self.cluster.ops_for_object(object).await?;
        if let Err(err) = action.execute(ops.as_ref(), object).await {
            warn!(
                action = action_name,
                object = unstructured::name(object),
                err = %format!("{:#}", err),
                "action failed"
            );
            return Err(err);
        }
        Ok(())
    }
}
