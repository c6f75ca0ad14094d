//! Rollout engine scenarios: group ordering, parallelism, error tolerance
//! and feedback.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::time::{Duration, Instant};

use capstan_feedback::{ConditionStatus, Feedback};
use capstan_rollout::actions::default_actions;
use capstan_rollout::checks::SuccessChecks;
use capstan_rollout::{Runner, RolloutConfig};

use common::*;

fn runner(cluster: Arc<FakeCluster>, result: capstan_render::RenderResult) -> Runner {
    let checks = Arc::new(SuccessChecks::new(cluster.clone(), vec![], None).unwrap());
    let mut runner = Runner::new(
        cluster,
        Arc::new(FixedRenderer { result }),
        checks,
        false,
    );
    runner.set_object_actions(default_actions());
    runner
}

#[tokio::test]
async fn simple_rollout_creates_missing_object() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let result = render_result(
        vec![(
            "deploy",
            json!({
                "apiVersion": "apps/v1", "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "ns"}
            }),
        )],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: e1}
spec:
  groups:
  - name: g1
    steps:
    - {object: deploy, action: CreateOrUpdate}
"#,
    );

    runner(cluster, result).execute(None).await.unwrap();

    assert_eq!(ops.creates.load(Ordering::SeqCst), 1);
    assert_eq!(ops.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn existing_object_is_updated_not_created() {
    let ops = FakeOps::new();
    ops.seed(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "ns", "resourceVersion": "9"}
    }));
    let cluster = FakeCluster::new(ops.clone());
    let result = render_result(
        vec![(
            "deploy",
            json!({
                "apiVersion": "apps/v1", "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "ns"}
            }),
        )],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: update}
spec:
  groups:
  - name: g1
    steps:
    - {object: deploy, action: CreateOrUpdate}
"#,
    );

    runner(cluster, result).execute(None).await.unwrap();

    assert_eq!(ops.creates.load(Ordering::SeqCst), 0);
    assert_eq!(ops.updates.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn parallel_group_runs_steps_concurrently() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let mk = |ms: u64| json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": format!("cm-{ms}")}, "spec": {"sleepMs": ms}});
    let result = render_result(
        vec![("s1", mk(50)), ("s2", mk(10)), ("s3", mk(30))],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: e2}
spec:
  groups:
  - name: g
    parallel: true
    steps:
    - {object: s1, action: Sleep}
    - {object: s2, action: Sleep}
    - {object: s3, action: Sleep}
"#,
    );

    let sleep = SleepAction::new();
    let checks = Arc::new(SuccessChecks::new(cluster.clone(), vec![], None).unwrap());
    let mut runner = Runner::new(cluster, Arc::new(FixedRenderer { result }), checks, false);
    runner.set_object_actions(vec![sleep.clone()]);

    let started = Instant::now();
    runner.execute(None).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(sleep.invocations.load(Ordering::SeqCst), 3);
    // max of the sleeps, not their sum
    assert!(elapsed >= Duration::from_millis(50), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(90), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn continue_on_error_keeps_the_group_going() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let mk = |n: &str| json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": n}, "spec": {"sleepMs": 0}});
    let result = render_result(
        vec![("s1", mk("a")), ("s2", mk("b")), ("s3", mk("c"))],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: e3}
spec:
  groups:
  - name: g
    steps:
    - {object: s1, action: Sleep}
    - {object: s2, action: Fail, continueOnError: true}
    - {object: s3, action: Sleep}
"#,
    );

    let sleep = SleepAction::new();
    let fail = FailAction::new();
    let checks = Arc::new(SuccessChecks::new(cluster.clone(), vec![], None).unwrap());
    let mut runner = Runner::new(cluster, Arc::new(FixedRenderer { result }), checks, false);
    runner.set_object_actions(vec![
        sleep.clone() as Arc<dyn capstan_rollout::actions::ObjectAction>,
        fail.clone(),
    ]);

    runner.execute(None).await.unwrap();

    assert_eq!(sleep.invocations.load(Ordering::SeqCst), 2);
    assert_eq!(fail.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_step_without_tolerance_aborts_the_rollout() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let mk = |n: &str| json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": n}, "spec": {"sleepMs": 0}});
    let result = render_result(
        vec![("s1", mk("a")), ("s2", mk("b"))],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: abort}
spec:
  groups:
  - name: g
    steps:
    - {object: s1, action: Fail}
    - {object: s2, action: Sleep}
"#,
    );

    let sleep = SleepAction::new();
    let fail = FailAction::new();
    let checks = Arc::new(SuccessChecks::new(cluster.clone(), vec![], None).unwrap());
    let mut runner = Runner::new(cluster, Arc::new(FixedRenderer { result }), checks, false);
    runner.set_object_actions(vec![
        fail.clone() as Arc<dyn capstan_rollout::actions::ObjectAction>,
        sleep.clone(),
    ]);

    assert!(runner.execute(None).await.is_err());
    assert_eq!(fail.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(sleep.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_object_reference_is_an_error() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let result = render_result(
        vec![],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: missing}
spec:
  groups:
  - name: g
    steps:
    - {object: nowhere, action: CreateOrUpdate}
"#,
    );

    let err = runner(cluster, result).execute(None).await.unwrap_err();
    assert!(format!("{:#}", err).contains("could not find object named"));
}

#[tokio::test]
async fn unknown_action_is_an_error() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let result = render_result(
        vec![("s1", json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}))],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: unknown}
spec:
  groups:
  - name: g
    steps:
    - {object: s1, action: Vanish}
"#,
    );

    let err = runner(cluster, result).execute(None).await.unwrap_err();
    assert!(format!("{:#}", err).contains("unknown action"));
}

#[tokio::test]
async fn list_objects_apply_per_item() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let list = json!({
        "apiVersion": "v1", "kind": "ConfigMapList",
        "items": [
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}},
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}}
        ]
    });
    let result = render_result(
        vec![("cms", list)],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: list}
spec:
  groups:
  - name: g
    steps:
    - {object: cms, action: CreateOrUpdate}
"#,
    );

    runner(cluster, result).execute(None).await.unwrap();
    assert_eq!(ops.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn render_only_emits_without_touching_the_cluster() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let result = render_result(
        vec![("s1", json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}))],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: render-only}
spec:
  groups:
  - name: g
    steps:
    - {object: s1, action: CreateOrUpdate}
"#,
    );

    let checks = Arc::new(SuccessChecks::new(cluster.clone(), vec![], None).unwrap());
    let mut runner = Runner::new(cluster, Arc::new(FixedRenderer { result }), checks, true);
    runner.set_object_actions(default_actions());

    runner.execute(None).await.unwrap();
    assert_eq!(ops.gets.load(Ordering::SeqCst), 0);
    assert_eq!(ops.creates.load(Ordering::SeqCst), 0);
}

#[derive(Default)]
struct RecordingFeedback {
    initialized: Mutex<Vec<String>>,
    conditions: Mutex<Vec<(String, ConditionStatus)>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Feedback for RecordingFeedback {
    async fn initialize(&self, groups: &[String]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.initialized.lock().unwrap() = groups.to_vec();
        Ok(())
    }

    async fn set_condition(&self, name: &str, status: ConditionStatus) -> Result<()> {
        self.conditions
            .lock()
            .unwrap()
            .push((name.to_string(), status));
        Ok(())
    }
}

#[tokio::test]
async fn feedback_sees_groups_finish_in_order() {
    let ops = FakeOps::new();
    let cluster = FakeCluster::new(ops.clone());
    let mk = |n: &str| json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": n}});
    let result = render_result(
        vec![("a", mk("a")), ("b", mk("b"))],
        r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata: {name: fb}
spec:
  groups:
  - name: first
    steps:
    - {object: a, action: CreateOrUpdate}
  - name: second
    steps:
    - {object: b, action: CreateOrUpdate}
"#,
    );

    let feedback = Arc::new(RecordingFeedback::default());
    let config = RolloutConfig {
        raw_config: None,
        feedback: Some(feedback.clone()),
    };
    runner(cluster, result)
        .execute(Some(&config))
        .await
        .unwrap();

    assert_eq!(
        *feedback.initialized.lock().unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert_eq!(
        *feedback.conditions.lock().unwrap(),
        vec![
            ("first".to_string(), ConditionStatus::Finished),
            ("second".to_string(), ConditionStatus::Finished)
        ]
    );
}
