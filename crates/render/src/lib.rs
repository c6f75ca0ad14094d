//! Rendering contract: a renderer turns a raw trigger payload into a set of
//! named objects plus the rollout plan that applies them.

#![forbid(unsafe_code)]

mod file;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use capstan_core::plan::Rollout;

pub use file::FileRenderer;

/// What a renderer produces: objects keyed by name, and the plan that rolls
/// them out. Also the shape emitted verbatim in render-only mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
    pub objects: BTreeMap<String, Value>,
    pub rollout: Rollout,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Must be pure with respect to the same inputs.
    async fn render(&self, raw_config: Option<&[u8]>) -> Result<RenderResult>;
}

/// An input source: a named closure a renderer may pull JSON bytes from
/// (a watched resource snapshot, a database query, ...).
pub type SourceFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

pub type Sources = HashMap<String, SourceFn>;
