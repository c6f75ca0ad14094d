//! Triggers initiate rollouts. Each trigger owns an ordered list of
//! subscribers and hands them a rollout config when its event source fires.

#![forbid(unsafe_code)]

pub mod database;
pub mod informer;
pub mod interval;
pub mod oneoff;
pub mod queue;
pub mod resource;
pub mod transform;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use capstan_rollout::RolloutConfig;

/// A rollout subscriber.
#[async_trait]
pub trait Execution: Send + Sync {
    async fn execute(&self, config: RolloutConfig) -> Result<()>;
}

#[async_trait]
pub trait Trigger: Send + Sync {
    /// Runs until the surrounding task is cancelled.
    async fn run(&self) -> Result<()>;

    fn register(&mut self, execution: Arc<dyn Execution>);
}

/// Fan-out harness shared by all triggers: subscribers run in order, the
/// first error stops the chain.
#[derive(Clone, Default)]
pub struct ExecutionRegister {
    executions: Vec<Arc<dyn Execution>>,
}

impl ExecutionRegister {
    pub fn register(&mut self, execution: Arc<dyn Execution>) {
        self.executions.push(execution);
    }

    pub async fn execute(&self, config: &RolloutConfig) -> Result<()> {
        for execution in &self.executions {
            execution.execute(config.clone()).await?;
        }
        Ok(())
    }
}
