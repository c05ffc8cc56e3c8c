use anyhow::{Context, Result};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;
use tracing::info;

use super::run::MIGRATIONS;
use fleetrack::config::Settings;

/// Apply pending migrations and exit
pub async fn handle_migrate(settings: Settings) -> Result<()> {
    let manager = ConnectionManager::<PgConnection>::new(&settings.database_url);
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .context("Failed to create database pool")?;

    let mut conn = pool
        .get()
        .context("Failed to get connection for migrations")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    if applied.is_empty() {
        info!("Database schema already up to date");
    } else {
        for version in &applied {
            info!("Applied migration {}", version);
        }
    }

    Ok(())
}
