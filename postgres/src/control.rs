//! `PostgreSQL`-backed `ControlRecordStore` (C4).
//!
//! Grounded on the teacher's `PostgresProjectionStore` /
//! `PostgresProjectionCheckpoint` in the upstream `projections` crate: the
//! same configurable-table-name-via-`format!`, `sqlx::query`/`query_as` +
//! `map_err` idiom, and `sqlx::migrate!` bootstrap.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE projections (
//!     name TEXT PRIMARY KEY,
//!     position JSONB NOT NULL,
//!     state JSONB NOT NULL,
//!     status TEXT NOT NULL,
//!     locked_until TIMESTAMPTZ NULL
//! );
//! ```

use composable_rust_core::projection::{
    ControlRecordStore, PositionMap, ProjectionError, ProjectionStatus, Result,
};
use composable_rust_core::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

fn status_to_sql(status: ProjectionStatus) -> Result<String> {
    match serde_json::to_value(status).map_err(|e| ProjectionError::Serialization(e.to_string()))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(ProjectionError::Serialization(format!(
            "unexpected status encoding: {other}"
        ))),
    }
}

fn status_from_sql(raw: &str) -> Result<ProjectionStatus> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| ProjectionError::Serialization(e.to_string()))
}

fn not_found(name: &str) -> ProjectionError {
    ProjectionError::ProjectionNotFound(name.to_string())
}

fn storage_err(error: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(error.to_string())
}

/// `PostgreSQL`-backed control-record store.
///
/// Holds one row per projection `name` in a single configurable table,
/// matching the table-name-as-config-constant shape the rest of this
/// workspace's Postgres stores use.
#[derive(Clone)]
pub struct PostgresControlRecordStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresControlRecordStore {
    /// Build a store over an existing pool, targeting `table_name`.
    #[must_use]
    pub const fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    /// Connect to `database_url` and build a store targeting `table_name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn connect(database_url: &str, table_name: String) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage_err)?;
        Ok(Self::new(pool, table_name))
    }

    /// Run the control-record table migration.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ControlRecordStore for PostgresControlRecordStore {
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let query = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE name = $1)", self.table_name);
            let row = sqlx::query(&query)
                .bind(&name)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?;
            Ok(row.try_get::<bool, _>(0).map_err(storage_err)?)
        })
    }

    fn create(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let status = status_to_sql(status)?;
            let query = format!(
                "INSERT INTO {} (name, position, state, status, locked_until)
                 VALUES ($1, '{{}}'::jsonb, '{{}}'::jsonb, $2, NULL)",
                self.table_name
            );
            sqlx::query(&query)
                .bind(&name)
                .bind(&status)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            Ok(())
        })
    }

    fn load(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(PositionMap, serde_json::Value)>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let query = format!("SELECT position, state FROM {} WHERE name = $1", self.table_name);
            let row = sqlx::query(&query)
                .bind(&name)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?
                .ok_or_else(|| not_found(&name))?;
            let position_json: serde_json::Value = row.try_get("position").map_err(storage_err)?;
            let state: serde_json::Value = row.try_get("state").map_err(storage_err)?;
            let position: PositionMap = serde_json::from_value(position_json)
                .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
            Ok((position, state))
        })
    }

    fn persist(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
        state: &serde_json::Value,
        position: &PositionMap,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        let state = state.clone();
        let position_json = serde_json::to_value(position);
        Box::pin(async move {
            let position_json =
                position_json.map_err(|e| ProjectionError::Serialization(e.to_string()))?;
            let query = format!(
                "UPDATE {} SET state = $2, position = $3, locked_until = $4 WHERE name = $1",
                self.table_name
            );
            let result = sqlx::query(&query)
                .bind(&name)
                .bind(&state)
                .bind(&position_json)
                .bind(locked_until)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != 1 {
                return Err(not_found(&name));
            }
            Ok(())
        })
    }

    fn fetch_status(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProjectionStatus>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let query = format!("SELECT status FROM {} WHERE name = $1", self.table_name);
            let row = sqlx::query(&query)
                .bind(&name)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?
                .ok_or_else(|| not_found(&name))?;
            let raw: String = row.try_get("status").map_err(storage_err)?;
            status_from_sql(&raw)
        })
    }

    fn update_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let status = status_to_sql(status)?;
            let query = format!("UPDATE {} SET status = $2 WHERE name = $1", self.table_name);
            let result = sqlx::query(&query)
                .bind(&name)
                .bind(&status)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != 1 {
                return Err(not_found(&name));
            }
            Ok(())
        })
    }

    fn clear_lock(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let status = status_to_sql(status)?;
            let query = format!(
                "UPDATE {} SET locked_until = NULL, status = $2 WHERE name = $1",
                self.table_name
            );
            let result = sqlx::query(&query)
                .bind(&name)
                .bind(&status)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != 1 {
                return Err(not_found(&name));
            }
            Ok(())
        })
    }

    fn acquire_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let running = status_to_sql(ProjectionStatus::Running)?;
            let query = format!(
                "UPDATE {} SET locked_until = $2, status = $3
                 WHERE name = $1 AND (locked_until IS NULL OR locked_until < now())",
                self.table_name
            );
            let result = sqlx::query(&query)
                .bind(&name)
                .bind(locked_until)
                .bind(&running)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != 1 {
                return Err(ProjectionError::LockNotAcquired(name));
            }
            Ok(())
        })
    }

    fn refresh_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let query = format!("UPDATE {} SET locked_until = $2 WHERE name = $1", self.table_name);
            let result = sqlx::query(&query)
                .bind(&name)
                .bind(locked_until)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != 1 {
                return Err(not_found(&name));
            }
            Ok(())
        })
    }

    fn delete_row(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let query = format!("DELETE FROM {} WHERE name = $1", self.table_name);
            let result = sqlx::query(&query)
                .bind(&name)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != 1 {
                return Err(not_found(&name));
            }
            Ok(())
        })
    }
}
