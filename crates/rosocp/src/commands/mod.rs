//! Subcommand implementations

pub mod aggregate;
pub mod migrate;
pub mod start;

use rosocp_lib::storage::PgStore;
use rosocp_lib::Settings;
use anyhow::{Context, Result};

/// Connect to the database configured in `settings`
pub async fn connect(settings: &Settings) -> Result<PgStore> {
    PgStore::connect(&settings.database)
        .await
        .with_context(|| {
            format!(
                "Unable to connect to database {}:{}/{}",
                settings.database.host, settings.database.port, settings.database.name
            )
        })
}
