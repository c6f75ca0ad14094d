//! Object actions: the named verbs a step can apply to one object.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use capstan_client::ResourceOps;
use capstan_core::unstructured;

#[async_trait]
pub trait ObjectAction: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, ops: &dyn ResourceOps, object: &Value) -> Result<()>;
}

pub fn default_actions() -> Vec<Arc<dyn ObjectAction>> {
    vec![
        Arc::new(CreateOrUpdate),
        Arc::new(CreateIfNotExist),
        Arc::new(DeleteIfExist),
    ]
}

pub struct CreateOrUpdate;

#[async_trait]
impl ObjectAction for CreateOrUpdate {
    fn name(&self) -> &'static str {
        "CreateOrUpdate"
    }

    async fn execute(&self, ops: &dyn ResourceOps, object: &Value) -> Result<()> {
        match ops.get_opt(unstructured::name(object)).await? {
            None => {
                ops.create(object).await?;
            }
            Some(current) => {
                ops.update_with_current(&current, object).await?;
            }
        }
        Ok(())
    }
}

pub struct CreateIfNotExist;

#[async_trait]
impl ObjectAction for CreateIfNotExist {
    fn name(&self) -> &'static str {
        "CreateIfNotExist"
    }

    async fn execute(&self, ops: &dyn ResourceOps, object: &Value) -> Result<()> {
        if ops.get_opt(unstructured::name(object)).await?.is_none() {
            ops.create(object).await?;
        }
        Ok(())
    }
}

pub struct DeleteIfExist;

#[async_trait]
impl ObjectAction for DeleteIfExist {
    fn name(&self) -> &'static str {
        "DeleteIfExist"
    }

    async fn execute(&self, ops: &dyn ResourceOps, object: &Value) -> Result<()> {
        // absent objects count as deleted
        ops.delete(unstructured::name(object)).await?;
        Ok(())
    }
}
