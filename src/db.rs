//! Database connection management and migrations.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::path::Path;

/// SQLite connection bundle for the history engine.
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Open (or create) the history database under `data_dir` and run
    /// migrations.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("threadline.db");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("failed to connect to SQLite at {}", db_path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .with_context(|| "failed to run database migrations")?;

        Ok(Self { pool })
    }

    /// Close the database connection gracefully.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
