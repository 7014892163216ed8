//! PostgreSQL metadata store. All _sys_* tables live in a schema named from `PACKAGER_SCHEMA` env (default `packager`).

mod dispatch;

use crate::bridge::{BridgeError, BridgeRequest, MetadataBridge, MetadataStore, MetadataTransaction, ResourceEnvelope};
use crate::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{ConnectOptions, Connection, PgConnection, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tokio::sync::Mutex;

pub(crate) const APPS_TABLE: &str = "_sys_apps";
pub(crate) const SERVICES_TABLE: &str = "_sys_services";
pub(crate) const SERVICE_TABLES_TABLE: &str = "_sys_service_tables";
pub(crate) const SERVICE_RECORDS_TABLE: &str = "_sys_service_records";

/// Schema name for _sys_* tables. From env `PACKAGER_SCHEMA`, default `packager`. Must be a valid PostgreSQL identifier.
pub fn packager_schema() -> String {
    std::env::var("PACKAGER_SCHEMA").unwrap_or_else(|_| "packager".into())
}

/// Returns schema-qualified table name for _sys_* tables (e.g. "packager._sys_apps").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", packager_schema(), table)
}

/// Create schema from `PACKAGER_SCHEMA` env if not exists, then the _sys_* tables.
pub async fn ensure_sys_tables(pool: &PgPool) -> Result<(), AppError> {
    let schema = packager_schema();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    let apps_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            payload JSONB NOT NULL,
            created_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        qualified_sys_table(APPS_TABLE)
    );
    sqlx::query(&apps_ddl).execute(pool).await?;

    let services_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            service_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            created_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        qualified_sys_table(SERVICES_TABLE)
    );
    sqlx::query(&services_ddl).execute(pool).await?;

    let tables_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            service TEXT NOT NULL,
            name TEXT NOT NULL,
            definition JSONB NOT NULL,
            created_date TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (service, name)
        )
        "#,
        qualified_sys_table(SERVICE_TABLES_TABLE)
    );
    sqlx::query(&tables_ddl).execute(pool).await?;

    let records_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            service TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record JSONB NOT NULL,
            created_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        qualified_sys_table(SERVICE_RECORDS_TABLE)
    );
    sqlx::query(&records_ddl).execute(pool).await?;
    let records_index = format!(
        "CREATE INDEX IF NOT EXISTS _sys_service_records_table_idx ON {} (service, table_name)",
        qualified_sys_table(SERVICE_RECORDS_TABLE)
    );
    let _ = sqlx::query(&records_index).execute(pool).await;

    Ok(())
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::Db)?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&db_name)))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url.rfind('/').ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))? + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres", base), db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn db_error(e: sqlx::Error) -> BridgeError {
    match e {
        sqlx::Error::RowNotFound => BridgeError::NotFound("row not found".into()),
        sqlx::Error::Database(db) if db.is_unique_violation() => BridgeError::Conflict(db.message().to_string()),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() || db.is_check_violation() => {
            BridgeError::BadRequest(db.message().to_string())
        }
        other => BridgeError::Internal(other.to_string()),
    }
}

/// Run one request inside its own transaction, or a savepoint when `conn` is already in one,
/// so a rejected request never leaves partial rows or poisons an enclosing transaction.
async fn run_isolated(conn: &mut PgConnection, env: &ResourceEnvelope, req: &BridgeRequest) -> Result<Value, BridgeError> {
    let mut scope = conn.begin().await.map_err(db_error)?;
    match dispatch::dispatch(&mut scope, env, req).await {
        Ok(value) => {
            scope.commit().await.map_err(db_error)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = scope.rollback().await {
                tracing::warn!(error = %rb, request = %req, "rollback of failed bridge request failed");
            }
            Err(e)
        }
    }
}

#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
    envelope: ResourceEnvelope,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool, envelope: ResourceEnvelope) -> Self {
        PgMetadataStore { pool, envelope }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataBridge for PgMetadataStore {
    async fn handle_request(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        run_isolated(&mut conn, &self.envelope, &request).await
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, BridgeError> {
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(Box::new(PgMetadataTransaction {
            tx: Mutex::new(tx),
            envelope: self.envelope.clone(),
        }))
    }
}

pub struct PgMetadataTransaction {
    tx: Mutex<Transaction<'static, Postgres>>,
    envelope: ResourceEnvelope,
}

#[async_trait]
impl MetadataBridge for PgMetadataTransaction {
    async fn handle_request(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        let mut tx = self.tx.lock().await;
        run_isolated(&mut tx, &self.envelope, &request).await
    }
}

#[async_trait]
impl MetadataTransaction for PgMetadataTransaction {
    async fn commit(self: Box<Self>) -> Result<(), BridgeError> {
        self.tx.into_inner().commit().await.map_err(db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), BridgeError> {
        self.tx.into_inner().rollback().await.map_err(db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_name_is_split_from_url() {
        let (admin, db) = parse_db_name_from_url("postgres://u:p@localhost:5432/packager_db?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
        assert_eq!(db, "packager_db");
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("my\"db"), "\"my\"\"db\"");
    }

    #[test]
    fn not_found_maps_from_row_not_found() {
        assert!(matches!(db_error(sqlx::Error::RowNotFound), BridgeError::NotFound(_)));
        assert!(matches!(db_error(sqlx::Error::PoolTimedOut), BridgeError::Internal(_)));
    }
}
