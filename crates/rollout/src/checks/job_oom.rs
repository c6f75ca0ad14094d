//! Failure check: a Job is definitively failed when one of its pods has a
//! container terminated with reason OOMKilled.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use capstan_client::Cluster;
use capstan_core::unstructured;

use super::FailureCheck;

#[derive(Debug, thiserror::Error)]
pub enum JobCheckError {
    #[error("not a job")]
    NotAJob,
    #[error("pod {namespace}/{name} was OOMKilled")]
    OomKilled { namespace: String, name: String },
}

pub struct JobOomKilledCheck;

#[async_trait]
impl FailureCheck for JobOomKilledCheck {
    fn name(&self) -> &'static str {
        "JobOOMKilled"
    }

    async fn execute(&self, cluster: &dyn Cluster, object: &Value) -> Result<()> {
        if unstructured::kind(object) != "Job" {
            return Err(JobCheckError::NotAJob.into());
        }

        let namespace = unstructured::namespace(object);
        let pods = cluster.resource_ops("v1", "Pod", namespace).await?;
        let selector = format!("job-name={}", unstructured::name(object));
        let items = pods.list(Some(&selector)).await?;

        for pod in &items {
            let statuses = unstructured::nested_slice(pod, &["status", "containerStatuses"])
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for status in statuses {
                let reason =
                    unstructured::nested_str(status, &["state", "terminated", "reason"]);
                if reason == Some("OOMKilled") {
                    return Err(JobCheckError::OomKilled {
                        namespace: unstructured::namespace(pod).to_string(),
                        name: unstructured::name(pod).to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    fn is_failed_error(&self, err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<JobCheckError>(),
            Some(JobCheckError::OomKilled { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_client::ResourceOps;
    use serde_json::json;
    use std::sync::Arc;

    struct PodListCluster {
        pods: Vec<Value>,
    }

    struct PodListOps {
        pods: Vec<Value>,
    }

    #[async_trait]
    impl ResourceOps for PodListOps {
        async fn get_opt(&self, _name: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn create(&self, obj: &Value) -> Result<Value> {
            Ok(obj.clone())
        }
        async fn update(&self, obj: &Value) -> Result<Value> {
            Ok(obj.clone())
        }
        async fn update_with_current(
            &self,
            _current: &Value,
            updated: &Value,
        ) -> Result<Option<Value>> {
            Ok(Some(updated.clone()))
        }
        async fn delete(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }
        async fn list(&self, _label_selector: Option<&str>) -> Result<Vec<Value>> {
            Ok(self.pods.clone())
        }
        async fn update_status(&self, obj: &Value) -> Result<Value> {
            Ok(obj.clone())
        }
    }

    #[async_trait]
    impl Cluster for PodListCluster {
        async fn resource_ops(
            &self,
            _api_version: &str,
            _kind: &str,
            _namespace: &str,
        ) -> Result<Arc<dyn ResourceOps>> {
            Ok(Arc::new(PodListOps {
                pods: self.pods.clone(),
            }))
        }
    }

    fn job() -> Value {
        json!({
            "apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "ns"}
        })
    }

    fn pod(reason: Option<&str>) -> Value {
        let state = match reason {
            Some(r) => json!({"terminated": {"reason": r, "exitCode": 137}}),
            None => json!({"running": {}}),
        };
        json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": "migrate-x1", "namespace": "ns"},
            "status": {"containerStatuses": [{"name": "main", "state": state}]}
        })
    }

    #[tokio::test]
    async fn non_jobs_are_refused() {
        let cluster = PodListCluster { pods: vec![] };
        let err = JobOomKilledCheck
            .execute(&cluster, &json!({"kind": "Deployment", "metadata": {"name": "d"}}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobCheckError>(),
            Some(JobCheckError::NotAJob)
        ));
        assert!(!JobOomKilledCheck.is_failed_error(&err));
    }

    #[tokio::test]
    async fn oom_killed_pod_is_a_classified_failure() {
        let cluster = PodListCluster {
            pods: vec![pod(None), pod(Some("OOMKilled"))],
        };
        let err = JobOomKilledCheck.execute(&cluster, &job()).await.unwrap_err();
        assert!(JobOomKilledCheck.is_failed_error(&err));
        assert!(err.to_string().contains("OOMKilled"));
    }

    #[tokio::test]
    async fn healthy_pods_pass() {
        let cluster = PodListCluster {
            pods: vec![pod(None), pod(Some("Completed"))],
        };
        assert!(JobOomKilledCheck.execute(&cluster, &job()).await.is_ok());
    }
}
