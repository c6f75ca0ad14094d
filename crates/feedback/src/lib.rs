//! Feedback: per-group rollout progress written onto the owning resource as
//! a `status.conditions` array, via the status subresource.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use capstan_client::Cluster;
use capstan_core::unstructured;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[serde(rename = "Not Started")]
    NotStarted,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Finished")]
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    pub last_transition_time: String,
    pub name: String,
    pub current_status: ConditionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub conditions: Vec<StatusCondition>,
}

#[async_trait]
pub trait Feedback: Send + Sync {
    async fn initialize(&self, groups: &[String]) -> Result<()>;
    async fn set_condition(&self, name: &str, status: ConditionStatus) -> Result<()>;
}

/// Feedback writer bound to one owner object. Owned by a single rollout at
/// a time.
pub struct StatusFeedback {
    cluster: Arc<dyn Cluster>,
    state: Mutex<State>,
}

struct State {
    obj: Value,
    /// Last status read from or written to the cluster.
    written: Option<Status>,
    current: Option<Status>,
}

impl StatusFeedback {
    pub fn new(cluster: Arc<dyn Cluster>, owner: Value) -> Self {
        let written = extract_status(&owner);
        StatusFeedback {
            cluster,
            state: Mutex::new(State {
                obj: owner,
                written,
                current: None,
            }),
        }
    }

    async fn update_status(&self, state: &mut State) -> Result<()> {
        if state.current == state.written {
            return Ok(());
        }

        let status = json!({
            "kind": unstructured::kind(&state.obj),
            "apiVersion": unstructured::api_version(&state.obj),
            "metadata": {
                "name": unstructured::name(&state.obj),
                "namespace": unstructured::namespace(&state.obj),
                "resourceVersion": unstructured::resource_version(&state.obj),
            },
            "status": state.current,
        });

        let ops = self.cluster.ops_for_object(&state.obj).await?;
        state.obj = ops.update_status(&status).await?;
        state.written = state.current.clone();
        Ok(())
    }
}

#[async_trait]
impl Feedback for StatusFeedback {
    async fn initialize(&self, groups: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(
            name = unstructured::name(&state.obj),
            namespace = unstructured::namespace(&state.obj),
            "initializing status conditions"
        );

        let existing: Vec<StatusCondition> = state
            .written
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        let mut conditions = Vec::with_capacity(groups.len());
        for group in groups {
            match existing.iter().find(|c| &c.name == group) {
                Some(c) => conditions.push(c.clone()),
                None => conditions.push(StatusCondition {
                    last_transition_time: now_rfc3339(),
                    name: group.clone(),
                    current_status: ConditionStatus::NotStarted,
                }),
            }
        }
        state.current = Some(Status { conditions });
        self.update_status(&mut state).await
    }

    async fn set_condition(&self, name: &str, status: ConditionStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(
            condition = name,
            status = ?status,
            owner = unstructured::name(&state.obj),
            "setting condition status"
        );

        let Some(current) = state.current.as_mut() else {
            // initialize was never called; nothing to transition
            return Ok(());
        };
        for c in current.conditions.iter_mut() {
            if c.name == name && c.current_status != status {
                *c = StatusCondition {
                    last_transition_time: now_rfc3339(),
                    name: name.to_string(),
                    current_status: status,
                };
            }
        }
        self.update_status(&mut state).await
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn extract_status(obj: &Value) -> Option<Status> {
    let conditions = unstructured::nested(obj, &["status", "conditions"])?;
    serde_json::from_value(json!({ "conditions": conditions })).ok()
}
