//! Config passer: a subscriber decorator that reads the render payload from
//! a file, when one is configured, before handing off to the engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use capstan_rollout::{RolloutConfig, Runner};
use capstan_trigger::Execution;

pub struct ConfigPasser {
    file: Option<PathBuf>,
    executor: Arc<Runner>,
}

impl ConfigPasser {
    pub fn new(file: Option<PathBuf>, executor: Arc<Runner>) -> Self {
        ConfigPasser { file, executor }
    }
}

#[async_trait]
impl Execution for ConfigPasser {
    async fn execute(&self, mut config: RolloutConfig) -> Result<()> {
        if let Some(file) = &self.file {
            config.raw_config = Some(
                tokio::fs::read(file)
                    .await
                    .with_context(|| format!("reading config file {}", file.display()))?,
            );
        }
        self.executor.execute(Some(&config)).await
    }
}
