//! Database trigger: polls configured queries and schedules one rollout per
//! previously-unseen key column value. Finished runs are pruned from the
//! active map on the next tick, under the trigger they were scheduled for.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use capstan_db::crdb::rows_to_json;
use capstan_db::{Connection, Connections};
use capstan_rollout::RolloutConfig;

use crate::{Execution, ExecutionRegister, Trigger};

const POLL_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TriggerConfigs {
    #[serde(default)]
    triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerConfig {
    name: String,
    database_name: String,
    query: String,
    key: String,
    #[serde(default)]
    groups_rows_to_array: bool,
}

struct TriggerRun {
    done: Arc<AtomicBool>,
}

pub struct DatabaseTrigger {
    register: ExecutionRegister,
    connections: Arc<Connections>,
    config: TriggerConfigs,
    // trigger name -> key -> active run
    active: Mutex<HashMap<String, HashMap<String, TriggerRun>>>,
}

impl DatabaseTrigger {
    pub async fn new(
        connections: Arc<Connections>,
        config_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = config_path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading database trigger config {}", path.display()))?;
        let config: TriggerConfigs = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing database trigger config {}", path.display()))?;

        let mut active = HashMap::new();
        for trigger in &config.triggers {
            active.insert(trigger.name.clone(), HashMap::new());
        }

        Ok(DatabaseTrigger {
            register: ExecutionRegister::default(),
            connections,
            config,
            active: Mutex::new(active),
        })
    }

    async fn run_trigger(&self, config: &TriggerConfig) {
        let mut ticker = tokio::time::interval(POLL_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.check_trigger(config).await {
                warn!(
                    trigger = %config.name,
                    err = %format!("{:#}", err),
                    "error checking trigger"
                );
            }
        }
    }

    async fn check_trigger(&self, config: &TriggerConfig) -> Result<()> {
        if let Some(runs) = self.active.lock().unwrap().get_mut(&config.name) {
            runs.retain(|_, run| !run.done.load(Ordering::SeqCst));
        }

        let client = match self.connections.get(&config.database_name) {
            Some(Connection::Cockroach(client)) => client.clone(),
            None => bail!("no connection for database {:?}", config.database_name),
        };

        debug!(trigger = %config.name, "executing trigger query");
        let rows = client.query_tx(&config.query).await.context("execute tx")?;
        for (key, payload) in runs_for_rows(config, rows_to_json(&rows))? {
            self.schedule_run(&config.name, key, payload);
        }
        Ok(())
    }

    fn schedule_run(&self, trigger_name: &str, key: String, payload: Vec<u8>) {
        let mut active = self.active.lock().unwrap();
        let Some(runs) = active.get_mut(trigger_name) else {
            return;
        };
        if runs.contains_key(&key) {
            return;
        }

        let done = Arc::new(AtomicBool::new(false));
        runs.insert(key.clone(), TriggerRun { done: done.clone() });
        drop(active);

        debug!(trigger = trigger_name, key = %key, "triggered");
        let register = self.register.clone();
        tokio::spawn(async move {
            let config = RolloutConfig {
                raw_config: Some(payload),
                feedback: None,
            };
            if let Err(err) = register.execute(&config).await {
                warn!(key = %key, err = %format!("{:#}", err), "error running");
            }
            done.store(true, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl Trigger for DatabaseTrigger {
    async fn run(&self) -> Result<()> {
        join_all(
            self.config
                .triggers
                .iter()
                .map(|config| self.run_trigger(config)),
        )
        .await;
        Ok(())
    }

    fn register(&mut self, execution: Arc<dyn Execution>) {
        self.register.register(execution);
    }
}

/// Turn query rows into `(key, payload)` pairs: one per row, or a single
/// pair carrying all rows as an array when `groupsRowsToArray` is set.
fn runs_for_rows(
    config: &TriggerConfig,
    rows: Vec<Map<String, Value>>,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut runs = Vec::new();
    let mut group_key = String::new();

    for row in &rows {
        let key = match row.get(&config.key) {
            Some(v) => trigger_key(v),
            None => bail!("key column {:?} not in result", config.key),
        };
        group_key.push_str(&key);

        if !config.groups_rows_to_array {
            let payload =
                serde_json::to_vec(&Value::Object(row.clone())).context("serializing row")?;
            runs.push((key, payload));
        }
    }

    if config.groups_rows_to_array {
        let payload = serde_json::to_vec(&Value::from(
            rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
        ))
        .context("serializing rows")?;
        runs.push((group_key, payload));
    }

    Ok(runs)
}

fn trigger_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
