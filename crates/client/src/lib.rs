//! Capstan cluster client: GVK discovery with a process-lifetime cache,
//! per-resource dynamic handles, and the update preparation/check chains
//! that run before any write.

#![forbid(unsafe_code)]

pub mod update;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use serde_json::Value;
use tracing::debug;

use capstan_core::unstructured;
use update::{UpdateCheck, UpdatePreparation};

/// The per-resource verb set the engine programs against. Implemented by
/// [`ResourceClient`] for a live cluster and by in-memory fakes in tests.
#[async_trait]
pub trait ResourceOps: Send + Sync {
    /// Get by name; `None` when the object does not exist.
    async fn get_opt(&self, name: &str) -> Result<Option<Value>>;

    async fn create(&self, obj: &Value) -> Result<Value>;

    async fn update(&self, obj: &Value) -> Result<Value>;

    /// Run the preparation chain, then the check chain, then update. Returns
    /// `None` when the checks decided no write is necessary.
    async fn update_with_current(&self, current: &Value, updated: &Value)
        -> Result<Option<Value>>;

    /// Delete with foreground propagation. Returns `false` when the object
    /// was already gone.
    async fn delete(&self, name: &str) -> Result<bool>;

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<Value>>;

    /// Write the status subresource, preserving resourceVersion optimistic
    /// concurrency.
    async fn update_status(&self, obj: &Value) -> Result<Value>;
}

/// Factory seam: resolves an untyped object to a [`ResourceOps`] handle.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn resource_ops(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceOps>>;

    async fn ops_for_object(&self, obj: &Value) -> Result<Arc<dyn ResourceOps>> {
        self.resource_ops(
            unstructured::api_version(obj),
            unstructured::kind(obj),
            unstructured::namespace(obj),
        )
        .await
    }
}

pub struct Client {
    kube: kube::Client,
    // GVK key -> (ApiResource, namespaced). Filled lazily from discovery.
    discovery: RwLock<HashMap<String, (ApiResource, bool)>>,
    preparations: Vec<Arc<dyn UpdatePreparation>>,
    checks: Vec<Arc<dyn UpdateCheck>>,
}

impl Client {
    pub fn new(kube: kube::Client) -> Self {
        Client {
            kube,
            discovery: RwLock::new(HashMap::new()),
            preparations: Vec::new(),
            checks: Vec::new(),
        }
    }

    /// A client carrying the default preparation and check chains.
    pub fn with_default_chains(kube: kube::Client) -> Self {
        let mut c = Client::new(kube);
        c.set_update_preparations(update::default_preparations());
        c.set_update_checks(update::default_checks());
        c
    }

    pub fn set_update_preparations(&mut self, preparations: Vec<Arc<dyn UpdatePreparation>>) {
        self.preparations = preparations;
    }

    pub fn set_update_checks(&mut self, checks: Vec<Arc<dyn UpdateCheck>>) {
        self.checks = checks;
    }

    pub fn kube(&self) -> kube::Client {
        self.kube.clone()
    }

    pub async fn client_for(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<ResourceClient> {
        let gvk = parse_gvk(api_version, kind)?;
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        let api: Api<DynamicObject> = if namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.kube.clone(), namespace, &ar)
        } else {
            Api::all_with(self.kube.clone(), &ar)
        };
        Ok(ResourceClient {
            api,
            preparations: self.preparations.clone(),
            checks: self.checks.clone(),
        })
    }

    pub async fn client_for_object(&self, obj: &Value) -> Result<ResourceClient> {
        self.client_for(
            unstructured::api_version(obj),
            unstructured::kind(obj),
            unstructured::namespace(obj),
        )
        .await
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.discovery.read().unwrap().get(&key).cloned() {
            return Ok(hit);
        }

        debug!(gvk = %key, "discovery cache miss; running discovery");
        let discovery = Discovery::new(self.kube.clone())
            .run()
            .await
            .context("running API discovery")?;
        let mut found = None;
        {
            let mut cache = self.discovery.write().unwrap();
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let entry_key = gvk_key(&GroupVersionKind {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                    });
                    if entry_key == key {
                        found = Some((ar.clone(), namespaced));
                    }
                    cache.insert(entry_key, (ar, namespaced));
                }
            }
        }
        found.ok_or_else(|| anyhow!("resource not served by the cluster: {}", key))
    }
}

#[async_trait]
impl Cluster for Client {
    async fn resource_ops(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceOps>> {
        Ok(Arc::new(self.client_for(api_version, kind, namespace).await?))
    }
}

/// Verbs over one discovered resource collection, with the update chains
/// attached.
#[derive(Clone)]
pub struct ResourceClient {
    api: Api<DynamicObject>,
    preparations: Vec<Arc<dyn UpdatePreparation>>,
    checks: Vec<Arc<dyn UpdateCheck>>,
}

impl ResourceClient {
    /// The underlying dynamic API handle, for watch wiring.
    pub fn dynamic_api(&self) -> Api<DynamicObject> {
        self.api.clone()
    }

    fn prepare_for_update(&self, current: &Value, updated: &Value) -> Result<Value> {
        let mut prepared = updated.clone();
        unstructured::set_resource_version(
            &mut prepared,
            unstructured::resource_version(current),
        )?;
        for p in &self.preparations {
            p.prepare(current, &mut prepared)
                .with_context(|| format!("update preparation {:?}", p.name()))?;
        }
        Ok(prepared)
    }

    fn check_for_update(&self, current: &Value, updated: &Value) -> Result<bool> {
        for c in &self.checks {
            let need = c
                .check(current, updated)
                .with_context(|| format!("update check {:?}", c.name()))?;
            if !need {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ResourceOps for ResourceClient {
    async fn get_opt(&self, name: &str) -> Result<Option<Value>> {
        let obj = self.api.get_opt(name).await?;
        obj.map(to_value).transpose()
    }

    async fn create(&self, obj: &Value) -> Result<Value> {
        let created = self
            .api
            .create(&PostParams::default(), &from_value(obj)?)
            .await?;
        to_value(created)
    }

    async fn update(&self, obj: &Value) -> Result<Value> {
        let name = unstructured::name(obj).to_string();
        let updated = self
            .api
            .replace(&name, &PostParams::default(), &from_value(obj)?)
            .await?;
        to_value(updated)
    }

    async fn update_with_current(
        &self,
        current: &Value,
        updated: &Value,
    ) -> Result<Option<Value>> {
        let prepared = self.prepare_for_update(current, updated)?;
        if !self.check_for_update(current, &prepared)? {
            debug!(
                name = unstructured::name(updated),
                "update checks decided no write is needed"
            );
            return Ok(None);
        }
        self.update(&prepared).await.map(Some)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        match self.api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<Value>> {
        let mut params = ListParams::default();
        if let Some(sel) = label_selector {
            params = params.labels(sel);
        }
        let list = self.api.list(&params).await?;
        list.items.into_iter().map(to_value).collect()
    }

    async fn update_status(&self, obj: &Value) -> Result<Value> {
        let name = unstructured::name(obj).to_string();
        let data = serde_json::to_vec(obj).context("serializing status object")?;
        let updated = self
            .api
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        to_value(updated)
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn to_value(obj: DynamicObject) -> Result<Value> {
    serde_json::to_value(obj).context("serializing DynamicObject")
}

fn from_value(v: &Value) -> Result<DynamicObject> {
    serde_json::from_value(v.clone()).context("object is missing apiVersion/kind/metadata")
}

fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind> {
    if kind.is_empty() {
        return Err(anyhow!("object has no kind"));
    }
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None if !api_version.is_empty() => (String::new(), api_version.to_string()),
        None => return Err(anyhow!("object has no apiVersion")),
    };
    Ok(GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    })
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}
