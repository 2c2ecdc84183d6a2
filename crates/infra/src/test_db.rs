//! Throwaway Postgres schemas for store tests.
//!
//! Set `CLINSYNC_TEST_DATABASE_URL` (or `DATABASE_URL`) to run the Postgres
//! tests; without it they return early. Each test gets its own schema through
//! the connection's `search_path`, so tests can run in parallel against one
//! database.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

pub(crate) struct TestDb {
    pub pool: PgPool,
    admin: PgPool,
    schema: String,
}

impl TestDb {
    pub async fn connect() -> Option<Self> {
        let Some(url) = std::env::var("CLINSYNC_TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty())
        else {
            eprintln!("no test database configured; skipping Postgres test");
            return None;
        };

        let admin = PgPool::connect(&url)
            .await
            .expect("failed to connect to test database");
        let schema = format!("clinsync_test_{}", uuid::Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
            .execute(&admin)
            .await
            .expect("failed to create test schema");

        let options = url
            .parse::<PgConnectOptions>()
            .expect("invalid test database url")
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .expect("failed to connect to test schema");

        Some(Self {
            pool,
            admin,
            schema,
        })
    }

    pub async fn drop_schema(self) {
        self.pool.close().await;
        sqlx::query(&format!("DROP SCHEMA \"{}\" CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("failed to drop test schema");
    }
}
