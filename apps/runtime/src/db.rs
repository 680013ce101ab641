use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Shared Postgres connection used by the ledger and contract stores.
///
/// Stores serialize access through the mutex and open one transaction per
/// mutating call.
#[derive(Clone)]
pub struct EscrowDb {
    client: Arc<Mutex<Client>>,
}

impl EscrowDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "escrow postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .context("postgres ping")?;
        Ok(())
    }
}
