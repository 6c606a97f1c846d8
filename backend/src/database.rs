use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, PgPool, Postgres};

use crate::config::DatabaseConfig;

/// Connect to Postgres, creating the database first when it does not exist yet.
pub async fn create_pool(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    if !Postgres::database_exists(&config.url).await? {
        Postgres::create_database(&config.url).await?;
        tracing::info!("Database created successfully");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .test_before_acquire(true)
        .connect(&config.url)
        .await?;

    tracing::info!(
        max = config.max_connections,
        min = config.min_connections,
        "Database pool created"
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}
