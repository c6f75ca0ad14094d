//! Resource trigger: turns watch events on configured resource kinds into
//! de-duplicated rollout invocations, keyed through the transformation
//! pipeline, with the main resource's cached object as the payload.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use capstan_client::{Client, Cluster};
use capstan_feedback::{Feedback, StatusFeedback};
use capstan_render::Sources;
use capstan_rollout::RolloutConfig;

use crate::informer::{Handler, Informer};
use crate::queue::RateLimitingQueue;
use crate::transform::{KeyTransformationConfig, KeyTransformations};
use crate::{Execution, ExecutionRegister, Trigger};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesTriggerConfig {
    pub main_resource: String,
    #[serde(default)]
    pub resources: Vec<ResourceTriggerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTriggerConfig {
    pub name: String,
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub key_transformations: Vec<KeyTransformationConfig>,
}

pub struct ResourceTrigger {
    register: ExecutionRegister,
    client: Arc<Client>,
    informers: HashMap<String, Arc<Informer>>,
    main: Arc<Informer>,
    queue: Arc<RateLimitingQueue>,
    write_status: bool,
}

impl ResourceTrigger {
    pub async fn new(
        client: Arc<Client>,
        config_path: impl AsRef<Path>,
        write_status: bool,
    ) -> Result<Self> {
        let path = config_path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading resource trigger config {}", path.display()))?;
        let config: ResourcesTriggerConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing resource trigger config {}", path.display()))?;

        let queue = RateLimitingQueue::new();
        let mut informers = HashMap::new();
        for r in &config.resources {
            let rc = client
                .client_for(
                    &r.api_version,
                    &r.kind,
                    r.namespace.as_deref().unwrap_or(""),
                )
                .await
                .with_context(|| {
                    format!("failed to create client for {} in {}", r.kind, r.api_version)
                })?;
            let transformations = KeyTransformations::new(&r.key_transformations)
                .with_context(|| {
                    format!("failed to create key transformations for {}", r.name)
                })?;
            let handler = enqueue_handler(r.name.clone(), transformations, queue.clone());
            let informer = Informer::new(
                r.name.clone(),
                rc.dynamic_api(),
                r.label_selector.clone(),
                handler,
            );
            informers.insert(r.name.clone(), informer);
        }

        let main = match informers.get(&config.main_resource) {
            Some(inf) => inf.clone(),
            None => bail!(
                "main resource {:?} is not among the configured resources",
                config.main_resource
            ),
        };

        Ok(ResourceTrigger {
            register: ExecutionRegister::default(),
            client,
            informers,
            main,
            queue,
            write_status,
        })
    }

    /// Every watched resource doubles as an input source exposing its cache
    /// snapshot under `<name>/list`.
    pub fn input_sources(&self) -> Sources {
        let mut sources = Sources::new();
        for (name, informer) in &self.informers {
            let informer = informer.clone();
            sources.insert(
                format!("{}/list", name),
                Arc::new(move || {
                    let informer = informer.clone();
                    Box::pin(async move { informer.snapshot_json() })
                }),
            );
        }
        sources
    }

    async fn sync(&self, key: &str) -> Result<()> {
        debug!(key, "sync triggered");
        let Some(obj) = self.main.get(key) else {
            debug!(key, "key not present in main resource cache, dropping");
            return Ok(());
        };

        let raw = serde_json::to_vec(&obj).context("serializing trigger payload")?;
        let feedback: Option<Arc<dyn Feedback>> = if self.write_status {
            let cluster: Arc<dyn Cluster> = self.client.clone();
            Some(Arc::new(StatusFeedback::new(cluster, obj)))
        } else {
            None
        };

        self.register
            .execute(&RolloutConfig {
                raw_config: Some(raw),
                feedback,
            })
            .await
    }
}

#[async_trait]
impl Trigger for ResourceTrigger {
    async fn run(&self) -> Result<()> {
        let mut informer_tasks = JoinSet::new();
        for informer in self.informers.values() {
            informer_tasks.spawn(informer.clone().run());
        }
        info!("resource trigger started");

        while let Some(key) = self.queue.get().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(err) => {
                    warn!(key, err = %format!("{:#}", err), "sync failed, requeueing");
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }

        informer_tasks.shutdown().await;
        Ok(())
    }

    fn register(&mut self, execution: Arc<dyn Execution>) {
        self.register.register(execution);
    }
}

/// Builds the informer handler: transform the key, suppress empty results,
/// enqueue the rest.
fn enqueue_handler(
    resource: String,
    transformations: KeyTransformations,
    queue: Arc<RateLimitingQueue>,
) -> Handler {
    Box::new(move |key| {
        let new_key = transformations.transform(key);
        debug!(resource = %resource, original = key, transformed = %new_key, "transformed key");
        if new_key.is_empty() {
            debug!(resource = %resource, original = key, "key dropped by transformations");
            return;
        }
        queue.add(new_key);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_transformations() {
        let raw = r#"
mainResource: services
resources:
- name: services
  kind: Service
  apiVersion: v1
  namespace: prod
  labelSelector: app=web
  keyTransformations:
  - action: replace
    regex: "^prod/(.*)$"
    replacement: "$1"
- name: endpoints
  kind: Endpoints
  apiVersion: v1
"#;
        let config: ResourcesTriggerConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.main_resource, "services");
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].label_selector.as_deref(), Some("app=web"));
        assert_eq!(config.resources[0].key_transformations.len(), 1);
        assert!(config.resources[1].namespace.is_none());
    }

    #[tokio::test]
    async fn handler_transforms_then_enqueues() {
        let queue = RateLimitingQueue::new();
        let transformations = KeyTransformations::new(&[
            KeyTransformationConfig {
                action: "replace".into(),
                regex: "^ns/(.*)$".into(),
                replacement: "$1".into(),
            },
            KeyTransformationConfig {
                action: "drop".into(),
                regex: "^system-".into(),
                replacement: String::new(),
            },
        ])
        .unwrap();
        let handler = enqueue_handler("test".into(), transformations, queue.clone());

        handler("ns/system-a");
        handler("ns/foo");

        assert_eq!(queue.get().await.as_deref(), Some("foo"));
        queue.shut_down();
        assert_eq!(queue.get().await, None);
    }
}
