//! One-off trigger: executes the subscriber chain exactly once.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use capstan_rollout::RolloutConfig;

use crate::{Execution, ExecutionRegister, Trigger};

#[derive(Default)]
pub struct OneOffTrigger {
    register: ExecutionRegister,
}

impl OneOffTrigger {
    pub fn new() -> Self {
        OneOffTrigger::default()
    }
}

#[async_trait]
impl Trigger for OneOffTrigger {
    async fn run(&self) -> Result<()> {
        self.register.execute(&RolloutConfig::default()).await
    }

    fn register(&mut self, execution: Arc<dyn Execution>) {
        self.register.register(execution);
    }
}
