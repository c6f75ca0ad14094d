//! Side-channel reporter backed by the database connection registry.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use capstan_core::plan::ReportConfig;
use capstan_db::{Connection, Connections};

use crate::checks::Reporter;

#[async_trait]
impl Reporter for Connections {
    async fn report(&self, config: &ReportConfig) -> Result<()> {
        let Some(db) = &config.database else {
            bail!("no reporting configured");
        };
        match self.get(&db.database_name) {
            Some(Connection::Cockroach(client)) => {
                client
                    .exec_tx(&db.query.stmt)
                    .await
                    .with_context(|| format!("dispatching report to {:?}", db.database_name))?;
                Ok(())
            }
            None => bail!("database connection {} not found", db.database_name),
        }
    }
}
