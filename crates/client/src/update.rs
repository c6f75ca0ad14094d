//! Update preparation and check chains. Preparations rewrite server-assigned
//! fields on the desired object before a write; checks decide whether the
//! write is necessary at all. Both chains run in registration order and are
//! open for extension.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use capstan_core::unstructured;

pub trait UpdatePreparation: Send + Sync {
    fn name(&self) -> &'static str;
    fn prepare(&self, current: &Value, updated: &mut Value) -> Result<()>;
}

pub trait UpdateCheck: Send + Sync {
    fn name(&self) -> &'static str;
    /// `false` short-circuits the chain: no write.
    fn check(&self, current: &Value, updated: &Value) -> Result<bool>;
}

pub fn default_preparations() -> Vec<Arc<dyn UpdatePreparation>> {
    vec![
        Arc::new(ServiceClusterIpPreparation),
        Arc::new(DeploymentRevisionPreparation),
    ]
}

pub fn default_checks() -> Vec<Arc<dyn UpdateCheck>> {
    vec![Arc::new(ServiceAccountUnchangedCheck)]
}

/// Services keep the cluster IP the apiserver allocated for them.
pub struct ServiceClusterIpPreparation;

impl UpdatePreparation for ServiceClusterIpPreparation {
    fn name(&self) -> &'static str {
        "service-cluster-ip"
    }

    fn prepare(&self, current: &Value, updated: &mut Value) -> Result<()> {
        if unstructured::api_version(updated) != "v1" || unstructured::kind(updated) != "Service"
        {
            return Ok(());
        }
        if let Some(ip) = unstructured::nested_str(current, &["spec", "clusterIP"]) {
            unstructured::set_nested(updated, &["spec", "clusterIP"], Value::from(ip))?;
        }
        Ok(())
    }
}

const DEPLOYMENT_REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Deployments keep the revision annotation the controller manages.
pub struct DeploymentRevisionPreparation;

impl UpdatePreparation for DeploymentRevisionPreparation {
    fn name(&self) -> &'static str {
        "deployment-revision"
    }

    fn prepare(&self, current: &Value, updated: &mut Value) -> Result<()> {
        let api_version = unstructured::api_version(updated);
        if !(api_version == "apps/v1" || api_version == "apps/v1beta2")
            || unstructured::kind(updated) != "Deployment"
        {
            return Ok(());
        }
        let revision = unstructured::annotations(current)
            .and_then(|a| a.get(DEPLOYMENT_REVISION_ANNOTATION))
            .cloned();
        if let Some(revision) = revision {
            unstructured::set_nested(
                updated,
                &["metadata", "annotations", DEPLOYMENT_REVISION_ANNOTATION],
                revision,
            )?;
        }
        Ok(())
    }
}

/// Updating a ServiceAccount whose identity and metadata are unchanged only
/// churns server-generated token secrets, so skip the write.
pub struct ServiceAccountUnchangedCheck;

impl UpdateCheck for ServiceAccountUnchangedCheck {
    fn name(&self) -> &'static str {
        "serviceaccount-unchanged"
    }

    fn check(&self, current: &Value, updated: &Value) -> Result<bool> {
        if unstructured::api_version(updated) != "v1"
            || unstructured::kind(updated) != "ServiceAccount"
        {
            return Ok(true);
        }
        let unchanged = unstructured::name(current) == unstructured::name(updated)
            && unstructured::namespace(current) == unstructured::namespace(updated)
            && unstructured::labels(current) == unstructured::labels(updated)
            && unstructured::annotations(current) == unstructured::annotations(updated);
        Ok(!unchanged)
    }
}
