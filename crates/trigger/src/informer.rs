//! List/watch informer: a local cache per watched resource kind, kept fresh
//! by a restarting watch stream, with an event handler fed on every change.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use capstan_core::unstructured;

const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub type Handler = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) enum CacheEvent {
    Applied(Value),
    Deleted(Value),
    Restarted(Vec<Value>),
}

/// The cache itself, factored out of the watch loop. Single writer (the
/// watch loop), many readers.
#[derive(Default)]
pub(crate) struct InformerState {
    cache: HashMap<String, Value>,
}

impl InformerState {
    /// Apply one event, returning the keys the handler should see. Updates
    /// that do not change the resourceVersion are swallowed.
    pub(crate) fn apply(&mut self, event: CacheEvent) -> Vec<String> {
        match event {
            CacheEvent::Applied(obj) => {
                let key = unstructured::meta_key(&obj);
                let unchanged = self
                    .cache
                    .get(&key)
                    .map(|old| {
                        unstructured::resource_version(old)
                            == unstructured::resource_version(&obj)
                    })
                    .unwrap_or(false);
                self.cache.insert(key.clone(), obj);
                if unchanged {
                    debug!(%key, "resource version unchanged");
                    Vec::new()
                } else {
                    vec![key]
                }
            }
            CacheEvent::Deleted(obj) => {
                let key = unstructured::meta_key(&obj);
                self.cache.remove(&key);
                vec![key]
            }
            CacheEvent::Restarted(objs) => {
                self.cache.clear();
                let mut keys = Vec::with_capacity(objs.len());
                for obj in objs {
                    let key = unstructured::meta_key(&obj);
                    self.cache.insert(key.clone(), obj);
                    keys.push(key);
                }
                keys
            }
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Value> {
        let mut keys: Vec<&String> = self.cache.keys().collect();
        keys.sort();
        keys.iter().map(|k| self.cache[*k].clone()).collect()
    }
}

pub struct Informer {
    name: String,
    api: Api<DynamicObject>,
    label_selector: Option<String>,
    state: RwLock<InformerState>,
    handler: Handler,
}

impl Informer {
    pub fn new(
        name: impl Into<String>,
        api: Api<DynamicObject>,
        label_selector: Option<String>,
        handler: Handler,
    ) -> Arc<Self> {
        Arc::new(Informer {
            name: name.into(),
            api,
            label_selector,
            state: RwLock::new(InformerState::default()),
            handler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().unwrap().get(key)
    }

    /// JSON of the current cache contents, ordered by key.
    pub fn snapshot_json(&self) -> Result<Vec<u8>> {
        let snapshot = self.state.read().unwrap().snapshot();
        serde_json::to_vec(&snapshot).context("serializing informer snapshot")
    }

    /// Drive the list/watch until the surrounding task is cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut config = watcher::Config::default();
        if let Some(sel) = &self.label_selector {
            config = config.labels(sel);
        }

        debug!(informer = %self.name, selector = ?self.label_selector, "informer starting");
        let mut backoff = Duration::from_secs(1);
        loop {
            let stream = watcher::watcher(self.api.clone(), config.clone());
            futures::pin_mut!(stream);

            let mut saw_event = false;
            loop {
                match stream.try_next().await {
                    Ok(Some(event)) => {
                        saw_event = true;
                        self.handle(event);
                    }
                    Ok(None) => {
                        warn!(informer = %self.name, "watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(informer = %self.name, error = %e, "watch stream error");
                        counter!("watch_errors_total", 1u64);
                        break;
                    }
                }
            }

            if saw_event {
                backoff = Duration::from_secs(1);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
            counter!("watch_restarts_total", 1u64);
        }
    }

    fn handle(&self, event: Event<DynamicObject>) {
        let cache_event = match event {
            Event::Applied(o) => match serde_json::to_value(&o) {
                Ok(v) => CacheEvent::Applied(v),
                Err(e) => {
                    warn!(informer = %self.name, error = %e, "dropping unserializable object");
                    return;
                }
            },
            Event::Deleted(o) => match serde_json::to_value(&o) {
                Ok(v) => CacheEvent::Deleted(v),
                Err(e) => {
                    warn!(informer = %self.name, error = %e, "dropping unserializable object");
                    return;
                }
            },
            Event::Restarted(list) => {
                let objs: Vec<Value> = list
                    .iter()
                    .filter_map(|o| serde_json::to_value(o).ok())
                    .collect();
                CacheEvent::Restarted(objs)
            }
        };

        let keys = self.state.write().unwrap().apply(cache_event);
        for key in keys {
            (self.handler)(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str, rv: &str) -> Value {
        json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "resourceVersion": rv}
        })
    }

    #[test]
    fn first_applied_event_notifies() {
        let mut state = InformerState::default();
        assert_eq!(state.apply(CacheEvent::Applied(obj("a", "1"))), vec!["ns/a"]);
        assert!(state.get("ns/a").is_some());
    }

    #[test]
    fn unchanged_resource_version_is_suppressed() {
        let mut state = InformerState::default();
        state.apply(CacheEvent::Applied(obj("a", "1")));
        assert!(state.apply(CacheEvent::Applied(obj("a", "1"))).is_empty());
        assert_eq!(state.apply(CacheEvent::Applied(obj("a", "2"))), vec!["ns/a"]);
    }

    #[test]
    fn delete_notifies_and_evicts() {
        let mut state = InformerState::default();
        state.apply(CacheEvent::Applied(obj("a", "1")));
        assert_eq!(state.apply(CacheEvent::Deleted(obj("a", "1"))), vec!["ns/a"]);
        assert!(state.get("ns/a").is_none());
    }

    #[test]
    fn restart_replaces_the_cache() {
        let mut state = InformerState::default();
        state.apply(CacheEvent::Applied(obj("gone", "1")));
        let keys = state.apply(CacheEvent::Restarted(vec![obj("a", "1"), obj("b", "2")]));
        assert_eq!(keys, vec!["ns/a", "ns/b"]);
        assert!(state.get("ns/gone").is_none());
        assert_eq!(state.snapshot().len(), 2);
    }
}
