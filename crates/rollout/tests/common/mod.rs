//! In-memory fakes shared by the rollout scenario tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use capstan_client::{Cluster, ResourceOps};
use capstan_core::plan::{ReportConfig, Rollout};
use capstan_core::unstructured;
use capstan_render::{RenderResult, Renderer};
use capstan_rollout::actions::ObjectAction;
use capstan_rollout::checks::{FailureCheck, Reporter};

#[derive(Default)]
pub struct FakeOps {
    store: Mutex<HashMap<String, Value>>,
    script: Mutex<VecDeque<Value>>,
    last_served: Mutex<Option<Value>>,
    pub gets: AtomicUsize,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeOps {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeOps::default())
    }

    pub fn seed(&self, obj: Value) {
        self.store
            .lock()
            .unwrap()
            .insert(unstructured::name(&obj).to_string(), obj);
    }

    /// Serve these objects from `get_opt`, in order; the last one repeats.
    pub fn script_gets(&self, objs: Vec<Value>) {
        *self.script.lock().unwrap() = objs.into();
    }
}

#[async_trait]
impl ResourceOps for FakeOps {
    async fn get_opt(&self, name: &str) -> Result<Option<Value>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            *self.last_served.lock().unwrap() = Some(next.clone());
            return Ok(Some(next));
        }
        if let Some(last) = self.last_served.lock().unwrap().clone() {
            return Ok(Some(last));
        }
        Ok(self.store.lock().unwrap().get(name).cloned())
    }

    async fn create(&self, obj: &Value) -> Result<Value> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.store
            .lock()
            .unwrap()
            .insert(unstructured::name(obj).to_string(), obj.clone());
        Ok(obj.clone())
    }

    async fn update(&self, obj: &Value) -> Result<Value> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(obj.clone())
    }

    async fn update_with_current(&self, _current: &Value, updated: &Value) -> Result<Option<Value>> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(Some(updated.clone()))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.lock().unwrap().remove(name).is_some())
    }

    async fn list(&self, _label_selector: Option<&str>) -> Result<Vec<Value>> {
        Ok(self.store.lock().unwrap().values().cloned().collect())
    }

    async fn update_status(&self, obj: &Value) -> Result<Value> {
        Ok(obj.clone())
    }
}

pub struct FakeCluster {
    pub ops: Arc<FakeOps>,
}

impl FakeCluster {
    pub fn new(ops: Arc<FakeOps>) -> Arc<Self> {
        Arc::new(FakeCluster { ops })
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn resource_ops(
        &self,
        _api_version: &str,
        _kind: &str,
        _namespace: &str,
    ) -> Result<Arc<dyn ResourceOps>> {
        Ok(self.ops.clone())
    }
}

pub struct FixedRenderer {
    pub result: RenderResult,
}

#[async_trait]
impl Renderer for FixedRenderer {
    async fn render(&self, _raw_config: Option<&[u8]>) -> Result<RenderResult> {
        Ok(self.result.clone())
    }
}

pub fn render_result(objects: Vec<(&str, Value)>, plan_yaml: &str) -> RenderResult {
    let rollout: Rollout = serde_yaml::from_str(plan_yaml).expect("plan yaml");
    let objects: BTreeMap<String, Value> =
        objects.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    RenderResult { objects, rollout }
}

/// An action that sleeps for `spec.sleepMs` of its object before counting
/// itself as done.
pub struct SleepAction {
    pub invocations: AtomicUsize,
}

impl SleepAction {
    pub fn new() -> Arc<Self> {
        Arc::new(SleepAction {
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ObjectAction for SleepAction {
    fn name(&self) -> &'static str {
        "Sleep"
    }

    async fn execute(&self, _ops: &dyn ResourceOps, object: &Value) -> Result<()> {
        let ms = unstructured::nested(object, &["spec", "sleepMs"])
            .and_then(Value::as_u64)
            .unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An action that fails every time, counting its invocations.
pub struct FailAction {
    pub invocations: AtomicUsize,
}

impl FailAction {
    pub fn new() -> Arc<Self> {
        Arc::new(FailAction {
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ObjectAction for FailAction {
    fn name(&self) -> &'static str {
        "Fail"
    }

    async fn execute(&self, _ops: &dyn ResourceOps, _object: &Value) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("boom"))
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub calls: AtomicUsize,
    pub last: Mutex<Option<ReportConfig>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingReporter::default())
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn report(&self, config: &ReportConfig) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(config.clone());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("fake check classified this object as failed")]
pub struct FakeFailure;

/// A failure check that always classifies the object as failed.
pub struct AlwaysFailedCheck {
    pub invocations: AtomicUsize,
}

impl AlwaysFailedCheck {
    pub fn new() -> Arc<Self> {
        Arc::new(AlwaysFailedCheck {
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl FailureCheck for AlwaysFailedCheck {
    fn name(&self) -> &'static str {
        "AlwaysFailed"
    }

    async fn execute(&self, _cluster: &dyn Cluster, _object: &Value) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(FakeFailure.into())
    }

    fn is_failed_error(&self, err: &anyhow::Error) -> bool {
        err.downcast_ref::<FakeFailure>().is_some()
    }
}

/// A failure check that must never run.
pub struct MustNotRunCheck;

#[async_trait]
impl FailureCheck for MustNotRunCheck {
    fn name(&self) -> &'static str {
        "MustNotRun"
    }

    async fn execute(&self, _cluster: &dyn Cluster, _object: &Value) -> Result<()> {
        Err(anyhow!("failure check ran although it must not"))
    }

    fn is_failed_error(&self, _err: &anyhow::Error) -> bool {
        false
    }
}
