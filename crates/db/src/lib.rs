//! Database connections: a named registry built once from a config file and
//! read-only afterwards. CockroachDB is the only connection type today.

#![forbid(unsafe_code)]

pub mod crdb;
pub mod source;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub use crdb::CrdbClient;

pub const TYPE_COCKROACHDB: &str = "cockroachdb";

#[derive(Debug, Deserialize)]
struct ConnectionsConfig {
    #[serde(default)]
    connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Deserialize)]
struct ConnectionConfig {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cockroachdb: Option<CockroachConfig>,
}

#[derive(Debug, Deserialize)]
struct CockroachConfig {
    conn_string: String,
}

#[derive(Clone, Debug)]
pub enum Connection {
    Cockroach(Arc<CrdbClient>),
}

/// The process-wide connection registry.
#[derive(Debug)]
pub struct Connections {
    connections: HashMap<String, Connection>,
}

impl Connections {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading database connections file {}", path.display()))?;
        let config: ConnectionsConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing database connections file {}", path.display()))?;
        Self::from_config(config).await
    }

    async fn from_config(config: ConnectionsConfig) -> Result<Self> {
        let mut names = HashSet::new();
        for conn in &config.connections {
            if !names.insert(conn.name.as_str()) {
                bail!(
                    "duplicate connection name, connection names must be unique: {}",
                    conn.name
                );
            }
        }

        let mut connections = HashMap::new();
        for conn in config.connections {
            match conn.kind.as_str() {
                TYPE_COCKROACHDB => {
                    let cfg = conn.cockroachdb.with_context(|| {
                        format!("connection {:?} is missing a cockroachdb block", conn.name)
                    })?;
                    let client = CrdbClient::connect(&cfg.conn_string)
                        .with_context(|| format!("creating cockroachdb client {:?}", conn.name))?;
                    connections.insert(conn.name, Connection::Cockroach(Arc::new(client)));
                }
                other => bail!("unknown connection type: {}", other),
            }
        }

        Ok(Connections { connections })
    }

    pub fn get(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }
}
