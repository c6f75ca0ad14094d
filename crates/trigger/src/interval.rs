//! Interval trigger: fires the subscriber chain on a fixed period with an
//! empty payload.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use capstan_rollout::RolloutConfig;

use crate::{Execution, ExecutionRegister, Trigger};

pub struct IntervalTrigger {
    register: ExecutionRegister,
    interval: Duration,
}

impl IntervalTrigger {
    pub fn new(interval: Duration) -> Self {
        IntervalTrigger {
            register: ExecutionRegister::default(),
            interval,
        }
    }
}

#[async_trait]
impl Trigger for IntervalTrigger {
    async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; wait a full period instead
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("interval triggered");
            if let Err(err) = self.register.execute(&RolloutConfig::default()).await {
                warn!(err = %format!("{:#}", err), "execution failed");
            }
        }
    }

    fn register(&mut self, execution: Arc<dyn Execution>) {
        self.register.register(execution);
    }
}
