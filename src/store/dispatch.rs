//! SQL for each bridge resource. Records are stored as JSONB payloads; `id` and `created_date`
//! come from their columns and are merged into the returned records.

use super::{
    db_error, qualified_sys_table, APPS_TABLE, SERVICES_TABLE, SERVICE_RECORDS_TABLE, SERVICE_TABLES_TABLE,
};
use crate::bridge::resource::{matches_filters, Resource};
use crate::bridge::{BridgeError, BridgeRequest, QueryOptions, ResourceEnvelope, Verb};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

pub(super) async fn dispatch(
    conn: &mut PgConnection,
    env: &ResourceEnvelope,
    req: &BridgeRequest,
) -> Result<Value, BridgeError> {
    let resource = Resource::parse(&req.service, &req.resource)?;
    match (req.verb, resource) {
        (Verb::Get, Resource::Apps) => Ok(env.wrap_response(list_rows(conn, APPS_TABLE, &req.query).await?)),
        (Verb::Get, Resource::App(id)) => get_row(conn, APPS_TABLE, "application", id).await,
        (Verb::Get, Resource::Services) => Ok(env.wrap_response(list_rows(conn, SERVICES_TABLE, &req.query).await?)),
        (Verb::Get, Resource::Service(id)) => get_row(conn, SERVICES_TABLE, "service", id).await,
        (Verb::Post, Resource::Apps) => {
            let records = env.unwrap(payload(req)?);
            Ok(env.wrap_response(insert_named(conn, APPS_TABLE, records).await?))
        }
        (Verb::Post, Resource::Services) => {
            let records = env.unwrap(payload(req)?);
            Ok(env.wrap_response(insert_named(conn, SERVICES_TABLE, records).await?))
        }
        (Verb::Get, Resource::Schema) => {
            require_service(conn, &req.service).await?;
            let tables = match req.query.ids() {
                Some(names) => table_definitions(conn, &req.service, &names).await?,
                None => all_table_definitions(conn, &req.service).await?,
            };
            Ok(env.wrap_response(tables))
        }
        (Verb::Get, Resource::SchemaTable(table)) => {
            require_service(conn, &req.service).await?;
            let mut defs = table_definitions(conn, &req.service, std::slice::from_ref(&table)).await?;
            Ok(defs.pop().unwrap_or(Value::Null))
        }
        (Verb::Post, Resource::Schema) => {
            require_service(conn, &req.service).await?;
            let created = create_tables(conn, &req.service, env.unwrap(payload(req)?)).await?;
            Ok(env.wrap_response(created))
        }
        (Verb::Get, Resource::Table(table)) => {
            require_service(conn, &req.service).await?;
            require_table(conn, &req.service, &table).await?;
            Ok(env.wrap_response(list_records(conn, &req.service, &table, &req.query).await?))
        }
        (Verb::Post, Resource::Table(table)) => {
            require_service(conn, &req.service).await?;
            require_table(conn, &req.service, &table).await?;
            let records = env.unwrap(payload(req)?);
            insert_records(conn, &req.service, &table, &records).await?;
            Ok(env.wrap_response(records))
        }
        (verb, _) => Err(BridgeError::Rejected {
            status: 405,
            message: format!("{} is not supported on {}/{}", verb, req.service, req.resource),
        }),
    }
}

fn payload(req: &BridgeRequest) -> Result<Value, BridgeError> {
    req.payload
        .clone()
        .ok_or_else(|| BridgeError::BadRequest(format!("{} requires a payload", req)))
}

fn row_to_record(id: i64, payload: Value, created_date: DateTime<Utc>) -> Value {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        _ => Map::new(),
    };
    obj.insert("id".into(), Value::from(id));
    obj.insert("created_date".into(), Value::from(created_date.to_rfc3339()));
    Value::Object(obj)
}

async fn list_rows(conn: &mut PgConnection, table: &str, query: &QueryOptions) -> Result<Vec<Value>, BridgeError> {
    let sql = format!("SELECT id, payload, created_date FROM {} ORDER BY id", qualified_sys_table(table));
    tracing::debug!(sql = %sql, "bridge list");
    let rows: Vec<(i64, Value, DateTime<Utc>)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await.map_err(db_error)?;
    Ok(rows
        .into_iter()
        .map(|(id, payload, created)| row_to_record(id, payload, created))
        .filter(|r| matches_filters(r, query))
        .take(query.limit().unwrap_or(usize::MAX))
        .collect())
}

async fn get_row(conn: &mut PgConnection, table: &str, label: &str, id: i64) -> Result<Value, BridgeError> {
    let sql = format!("SELECT id, payload, created_date FROM {} WHERE id = $1", qualified_sys_table(table));
    tracing::debug!(sql = %sql, id, "bridge get");
    let row: Option<(i64, Value, DateTime<Utc>)> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    row.map(|(id, payload, created)| row_to_record(id, payload, created))
        .ok_or_else(|| BridgeError::NotFound(format!("{} {}", label, id)))
}

fn required_str<'a>(obj: &'a Map<String, Value>, key: &str, label: &str) -> Result<&'a str, BridgeError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::BadRequest(format!("{} record requires '{}'", label, key)))
}

async fn insert_named(conn: &mut PgConnection, table: &str, records: Vec<Value>) -> Result<Vec<Value>, BridgeError> {
    let is_service = table == SERVICES_TABLE;
    let label = if is_service { "service" } else { "application" };
    let q_table = qualified_sys_table(table);
    let mut created = Vec::with_capacity(records.len());
    for record in records {
        let mut obj = match record {
            Value::Object(obj) => obj,
            _ => return Err(BridgeError::BadRequest(format!("{} record must be an object", label))),
        };
        obj.remove("id");
        obj.remove("created_date");
        let name = required_str(&obj, "name", label)?.to_string();
        let payload = Value::Object(obj);

        let (id, created_date): (i64, DateTime<Utc>) = if is_service {
            let service_type = payload
                .as_object()
                .map(|o| required_str(o, "type", label))
                .transpose()?
                .unwrap_or_default()
                .to_string();
            let sql = format!(
                "INSERT INTO {} (name, service_type, payload) VALUES ($1, $2, $3) RETURNING id, created_date",
                q_table
            );
            tracing::debug!(sql = %sql, name = %name, "bridge insert");
            sqlx::query_as(&sql)
                .bind(&name)
                .bind(&service_type)
                .bind(&payload)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error)?
        } else {
            let sql = format!(
                "INSERT INTO {} (name, payload) VALUES ($1, $2) RETURNING id, created_date",
                q_table
            );
            tracing::debug!(sql = %sql, name = %name, "bridge insert");
            sqlx::query_as(&sql)
                .bind(&name)
                .bind(&payload)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error)?
        };
        created.push(row_to_record(id, payload, created_date));
    }
    Ok(created)
}

async fn require_service(conn: &mut PgConnection, service: &str) -> Result<(), BridgeError> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE name = $1)", qualified_sys_table(SERVICES_TABLE));
    let exists: (bool,) = sqlx::query_as(&sql)
        .bind(service)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;
    if exists.0 {
        Ok(())
    } else {
        Err(BridgeError::NotFound(format!("service '{}'", service)))
    }
}

async fn require_table(conn: &mut PgConnection, service: &str, table: &str) -> Result<(), BridgeError> {
    table_definitions(conn, service, &[table.to_string()]).await.map(|_| ())
}

/// Definitions for `names`, in request order. Any missing table is `NotFound`.
async fn table_definitions(conn: &mut PgConnection, service: &str, names: &[String]) -> Result<Vec<Value>, BridgeError> {
    let sql = format!(
        "SELECT name, definition FROM {} WHERE service = $1 AND name = ANY($2)",
        qualified_sys_table(SERVICE_TABLES_TABLE)
    );
    tracing::debug!(sql = %sql, service, "bridge schema");
    let rows: Vec<(String, Value)> = sqlx::query_as(&sql)
        .bind(service)
        .bind(names)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;
    names
        .iter()
        .map(|name| {
            rows.iter()
                .find(|(n, _)| n == name)
                .map(|(_, def)| def.clone())
                .ok_or_else(|| BridgeError::NotFound(format!("table '{}' in service '{}'", name, service)))
        })
        .collect()
}

async fn all_table_definitions(conn: &mut PgConnection, service: &str) -> Result<Vec<Value>, BridgeError> {
    let sql = format!(
        "SELECT definition FROM {} WHERE service = $1 ORDER BY name",
        qualified_sys_table(SERVICE_TABLES_TABLE)
    );
    let rows: Vec<(Value,)> = sqlx::query_as(&sql)
        .bind(service)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(rows.into_iter().map(|(def,)| def).collect())
}

async fn create_tables(conn: &mut PgConnection, service: &str, tables: Vec<Value>) -> Result<Vec<Value>, BridgeError> {
    let sql = format!(
        "INSERT INTO {} (service, name, definition) VALUES ($1, $2, $3)",
        qualified_sys_table(SERVICE_TABLES_TABLE)
    );
    let mut created = Vec::with_capacity(tables.len());
    for def in tables {
        let name = def
            .as_object()
            .map(|o| required_str(o, "name", "table"))
            .transpose()?
            .ok_or_else(|| BridgeError::BadRequest("table definition must be an object".into()))?
            .to_string();
        tracing::debug!(sql = %sql, service, table = %name, "bridge create table");
        sqlx::query(&sql)
            .bind(service)
            .bind(&name)
            .bind(&def)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        created.push(json!({ "name": name }));
    }
    Ok(created)
}

async fn list_records(
    conn: &mut PgConnection,
    service: &str,
    table: &str,
    query: &QueryOptions,
) -> Result<Vec<Value>, BridgeError> {
    let sql = format!(
        "SELECT record FROM {} WHERE service = $1 AND table_name = $2 ORDER BY id",
        qualified_sys_table(SERVICE_RECORDS_TABLE)
    );
    let rows: Vec<(Value,)> = sqlx::query_as(&sql)
        .bind(service)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(rows
        .into_iter()
        .map(|(r,)| r)
        .filter(|r| matches_filters(r, query))
        .take(query.limit().unwrap_or(usize::MAX))
        .collect())
}

async fn insert_records(conn: &mut PgConnection, service: &str, table: &str, records: &[Value]) -> Result<(), BridgeError> {
    let sql = format!(
        "INSERT INTO {} (service, table_name, record) VALUES ($1, $2, $3)",
        qualified_sys_table(SERVICE_RECORDS_TABLE)
    );
    tracing::debug!(sql = %sql, service, table, count = records.len(), "bridge insert records");
    for record in records {
        sqlx::query(&sql)
            .bind(service)
            .bind(table)
            .bind(record)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    Ok(())
}
