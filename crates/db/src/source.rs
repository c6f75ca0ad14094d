//! Query-backed input sources: each configured query becomes a named source
//! that runs the query in a transaction and returns the rows as JSON.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use capstan_render::{SourceFn, Sources};

use crate::crdb::rows_to_json;
use crate::{Connection, Connections};

#[derive(Debug, Deserialize)]
struct DatabaseSourcesConfig {
    #[serde(default)]
    queries: Vec<DatabaseSourceQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseSourceQuery {
    name: String,
    database_name: String,
    query: String,
}

pub struct DatabaseSources {
    connections: Arc<Connections>,
    config: DatabaseSourcesConfig,
}

impl DatabaseSources {
    pub async fn from_file(
        connections: Arc<Connections>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading database sources file {}", path.display()))?;
        let config: DatabaseSourcesConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing database sources file {}", path.display()))?;
        Ok(DatabaseSources {
            connections,
            config,
        })
    }

    pub fn input_sources(&self) -> Result<Sources> {
        let mut sources = Sources::new();
        for q in &self.config.queries {
            debug!(source = %q.name, database = %q.database_name, "registering database source");
            sources.insert(q.name.clone(), self.source_for_query(q)?);
        }
        Ok(sources)
    }

    fn source_for_query(&self, q: &DatabaseSourceQuery) -> Result<SourceFn> {
        let conn = match self.connections.get(&q.database_name) {
            Some(Connection::Cockroach(client)) => client.clone(),
            None => bail!("no connection for database {:?}", q.database_name),
        };
        let query = q.query.clone();
        Ok(Arc::new(move || {
            let conn = conn.clone();
            let query = query.clone();
            Box::pin(async move {
                let rows = conn.query_tx(&query).await?;
                let maps = rows_to_json(&rows);
                serde_json::to_vec(&Value::from(
                    maps.into_iter().map(Value::Object).collect::<Vec<_>>(),
                ))
                .context("serializing query rows")
            })
        }))
    }
}
