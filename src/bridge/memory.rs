//! In-process metadata store. Used by tests and by embedders that keep metadata in memory.
//!
//! A transaction works on a private copy of the committed snapshot; commit replaces the
//! committed snapshot with it, rollback discards it. Requests against the store itself autocommit.
//! A transaction that wrote anything fails to commit with `Conflict` when the committed snapshot
//! moved after `begin`.

use super::resource::{matches_filters, Resource};
use super::{
    BridgeError, BridgeRequest, MetadataBridge, MetadataStore, MetadataTransaction, ResourceEnvelope, Verb,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone, Debug)]
struct Snapshot {
    apps: BTreeMap<i64, Value>,
    services: BTreeMap<i64, Value>,
    /// (service name, table name) -> table definition
    tables: BTreeMap<(String, String), Value>,
    records: BTreeMap<(String, String), Vec<Value>>,
    next_app_id: i64,
    next_service_id: i64,
    /// Bumped by every successful write.
    version: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            apps: BTreeMap::new(),
            services: BTreeMap::new(),
            tables: BTreeMap::new(),
            records: BTreeMap::new(),
            next_app_id: 1,
            next_service_id: 1,
            version: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct Fault {
    verb: Verb,
    service: String,
    resource_prefix: String,
    error: BridgeError,
}

#[derive(Clone, Default)]
struct Shared {
    requests: Arc<Mutex<Vec<BridgeRequest>>>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl Shared {
    async fn intercept(&self, request: &BridgeRequest) -> Result<(), BridgeError> {
        self.requests.lock().await.push(request.clone());
        let faults = self.faults.lock().await;
        match faults.iter().find(|f| {
            f.verb == request.verb
                && f.service == request.service
                && request.resource.trim_matches('/').starts_with(f.resource_prefix.trim_matches('/'))
        }) {
            Some(f) => Err(f.error.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct MemoryMetadataStore {
    committed: Arc<RwLock<Snapshot>>,
    shared: Shared,
    envelope: ResourceEnvelope,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        MemoryMetadataStore::new(ResourceEnvelope::default())
    }
}

impl MemoryMetadataStore {
    pub fn new(envelope: ResourceEnvelope) -> Self {
        MemoryMetadataStore {
            committed: Arc::new(RwLock::new(Snapshot::default())),
            shared: Shared::default(),
            envelope,
        }
    }

    /// Ids handed out to the next created application and service.
    pub async fn set_next_ids(&self, app_id: i64, service_id: i64) {
        let mut snap = self.committed.write().await;
        snap.next_app_id = app_id;
        snap.next_service_id = service_id;
        snap.version += 1;
    }

    pub async fn seed_app(&self, app: Value) -> Result<i64, BridgeError> {
        let mut snap = self.committed.write().await;
        let created = insert_named(&mut snap, Kind::App, vec![app])?;
        snap.version += 1;
        Ok(created[0]["id"].as_i64().unwrap_or_default())
    }

    pub async fn seed_service(&self, service: Value) -> Result<i64, BridgeError> {
        let mut snap = self.committed.write().await;
        let created = insert_named(&mut snap, Kind::Service, vec![service])?;
        snap.version += 1;
        Ok(created[0]["id"].as_i64().unwrap_or_default())
    }

    pub async fn seed_table(&self, service: &str, table: Value) -> Result<(), BridgeError> {
        let mut snap = self.committed.write().await;
        create_tables(&mut snap, service, vec![table])?;
        snap.version += 1;
        Ok(())
    }

    pub async fn seed_records(&self, service: &str, table: &str, records: Vec<Value>) -> Result<(), BridgeError> {
        let mut snap = self.committed.write().await;
        insert_records(&mut snap, service, table, records)?;
        snap.version += 1;
        Ok(())
    }

    /// Make every matching request fail with `error`. Matching is on verb, service and a
    /// resource path prefix.
    pub async fn fail_on(&self, verb: Verb, service: &str, resource_prefix: &str, error: BridgeError) {
        self.shared.faults.lock().await.push(Fault {
            verb,
            service: service.to_string(),
            resource_prefix: resource_prefix.to_string(),
            error,
        });
    }

    /// Every request received so far, transactional or not, in arrival order.
    pub async fn requests(&self) -> Vec<BridgeRequest> {
        self.shared.requests.lock().await.clone()
    }

    pub async fn app_count(&self) -> usize {
        self.committed.read().await.apps.len()
    }

    pub async fn service_count(&self) -> usize {
        self.committed.read().await.services.len()
    }

    pub async fn table_names(&self, service: &str) -> Vec<String> {
        self.committed
            .read()
            .await
            .tables
            .keys()
            .filter(|(s, _)| s == service)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub async fn records(&self, service: &str, table: &str) -> Vec<Value> {
        self.committed
            .read()
            .await
            .records
            .get(&(service.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataBridge for MemoryMetadataStore {
    async fn handle_request(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        self.shared.intercept(&request).await?;
        if request.verb == Verb::Get {
            let snap = self.committed.read().await;
            return dispatch_read(&snap, &self.envelope, &request);
        }
        let mut snap = self.committed.write().await;
        dispatch(&mut snap, &self.envelope, &request)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, BridgeError> {
        let working = self.committed.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            committed: Arc::clone(&self.committed),
            base_version: working.version,
            working: Mutex::new(working),
            shared: self.shared.clone(),
            envelope: self.envelope.clone(),
        }))
    }
}

struct MemoryTransaction {
    committed: Arc<RwLock<Snapshot>>,
    base_version: u64,
    working: Mutex<Snapshot>,
    shared: Shared,
    envelope: ResourceEnvelope,
}

#[async_trait]
impl MetadataBridge for MemoryTransaction {
    async fn handle_request(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        self.shared.intercept(&request).await?;
        let mut snap = self.working.lock().await;
        dispatch(&mut snap, &self.envelope, &request)
    }
}

#[async_trait]
impl MetadataTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), BridgeError> {
        let MemoryTransaction {
            committed,
            base_version,
            working,
            ..
        } = *self;
        let mut working = working.into_inner();
        if working.version == base_version {
            return Ok(());
        }
        let mut committed = committed.write().await;
        if committed.version != base_version {
            return Err(BridgeError::Conflict(
                "metadata changed since the transaction began".into(),
            ));
        }
        working.version = base_version + 1;
        *committed = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Kind {
    App,
    Service,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::App => "application",
            Kind::Service => "service",
        }
    }

    fn rows(self, snap: &Snapshot) -> &BTreeMap<i64, Value> {
        match self {
            Kind::App => &snap.apps,
            Kind::Service => &snap.services,
        }
    }
}

fn dispatch(snap: &mut Snapshot, env: &ResourceEnvelope, req: &BridgeRequest) -> Result<Value, BridgeError> {
    if req.verb == Verb::Get {
        return dispatch_read(snap, env, req);
    }
    let response = dispatch_write(snap, env, req)?;
    snap.version += 1;
    Ok(response)
}

fn dispatch_write(snap: &mut Snapshot, env: &ResourceEnvelope, req: &BridgeRequest) -> Result<Value, BridgeError> {
    let resource = Resource::parse(&req.service, &req.resource)?;
    match (req.verb, resource) {
        (Verb::Post, Resource::Apps) => {
            let created = insert_named(snap, Kind::App, env.unwrap(payload(req)?))?;
            Ok(env.wrap_response(created))
        }
        (Verb::Post, Resource::Services) => {
            let created = insert_named(snap, Kind::Service, env.unwrap(payload(req)?))?;
            Ok(env.wrap_response(created))
        }
        (Verb::Post, Resource::Schema) => {
            let created = create_tables(snap, &req.service, env.unwrap(payload(req)?))?;
            Ok(env.wrap_response(created))
        }
        (Verb::Post, Resource::Table(table)) => {
            let created = insert_records(snap, &req.service, &table, env.unwrap(payload(req)?))?;
            Ok(env.wrap_response(created))
        }
        (verb, _) => Err(not_allowed(verb, req)),
    }
}

fn dispatch_read(snap: &Snapshot, env: &ResourceEnvelope, req: &BridgeRequest) -> Result<Value, BridgeError> {
    let resource = Resource::parse(&req.service, &req.resource)?;
    if req.verb != Verb::Get {
        return Err(not_allowed(req.verb, req));
    }
    let limit = req.query.limit().unwrap_or(usize::MAX);
    match resource {
        Resource::Apps => Ok(env.wrap_response(list(snap, Kind::App, req, limit))),
        Resource::Services => Ok(env.wrap_response(list(snap, Kind::Service, req, limit))),
        Resource::App(id) => get_by_id(snap, Kind::App, id),
        Resource::Service(id) => get_by_id(snap, Kind::Service, id),
        Resource::Schema => {
            require_service(snap, &req.service)?;
            let tables = match req.query.ids() {
                Some(names) => names
                    .iter()
                    .map(|t| table_definition(snap, &req.service, t))
                    .collect::<Result<Vec<_>, _>>()?,
                None => snap
                    .tables
                    .iter()
                    .filter(|((s, _), _)| s == &req.service)
                    .map(|(_, def)| def.clone())
                    .collect(),
            };
            Ok(env.wrap_response(tables))
        }
        Resource::SchemaTable(table) => {
            require_service(snap, &req.service)?;
            table_definition(snap, &req.service, &table)
        }
        Resource::Table(table) => {
            require_service(snap, &req.service)?;
            table_definition(snap, &req.service, &table)?;
            let rows: Vec<Value> = snap
                .records
                .get(&(req.service.clone(), table))
                .map(|rows| {
                    rows.iter()
                        .filter(|r| matches_filters(r, &req.query))
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(env.wrap_response(rows))
        }
    }
}

fn list(snap: &Snapshot, kind: Kind, req: &BridgeRequest, limit: usize) -> Vec<Value> {
    kind.rows(snap)
        .values()
        .filter(|r| matches_filters(r, &req.query))
        .take(limit)
        .cloned()
        .collect()
}

fn payload(req: &BridgeRequest) -> Result<Value, BridgeError> {
    req.payload
        .clone()
        .ok_or_else(|| BridgeError::BadRequest(format!("{} requires a payload", req)))
}

fn not_allowed(verb: Verb, req: &BridgeRequest) -> BridgeError {
    BridgeError::Rejected {
        status: 405,
        message: format!("{} is not supported on {}/{}", verb, req.service, req.resource),
    }
}

fn get_by_id(snap: &Snapshot, kind: Kind, id: i64) -> Result<Value, BridgeError> {
    kind.rows(snap)
        .get(&id)
        .cloned()
        .ok_or_else(|| BridgeError::NotFound(format!("{} {}", kind.label(), id)))
}

fn name_of(record: &Value) -> Option<&str> {
    record
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
}

/// Validate the whole batch before inserting so a rejected request leaves no partial rows.
fn insert_named(snap: &mut Snapshot, kind: Kind, records: Vec<Value>) -> Result<Vec<Value>, BridgeError> {
    let mut seen: Vec<String> = Vec::with_capacity(records.len());
    for record in &records {
        if !record.is_object() {
            return Err(BridgeError::BadRequest(format!("{} record must be an object", kind.label())));
        }
        let name = name_of(record)
            .ok_or_else(|| BridgeError::BadRequest(format!("{} record requires 'name'", kind.label())))?;
        if let Kind::Service = kind {
            if record.get("type").and_then(Value::as_str).map(str::is_empty).unwrap_or(true) {
                return Err(BridgeError::BadRequest(format!("service '{}' requires 'type'", name)));
            }
        }
        let taken = kind.rows(snap).values().any(|r| name_of(r) == Some(name)) || seen.iter().any(|s| s == name);
        if taken {
            return Err(BridgeError::Conflict(format!("{} '{}' already exists", kind.label(), name)));
        }
        seen.push(name.to_string());
    }

    let mut created = Vec::with_capacity(records.len());
    for record in records {
        let mut obj: Map<String, Value> = match record {
            Value::Object(obj) => obj,
            _ => continue,
        };
        let id = match kind {
            Kind::App => {
                let id = snap.next_app_id;
                snap.next_app_id += 1;
                id
            }
            Kind::Service => {
                let id = snap.next_service_id;
                snap.next_service_id += 1;
                id
            }
        };
        obj.insert("id".into(), Value::from(id));
        obj.entry("created_date")
            .or_insert_with(|| Value::from(Utc::now().to_rfc3339()));
        let row = Value::Object(obj);
        match kind {
            Kind::App => snap.apps.insert(id, row.clone()),
            Kind::Service => snap.services.insert(id, row.clone()),
        };
        created.push(row);
    }
    Ok(created)
}

fn require_service(snap: &Snapshot, service: &str) -> Result<(), BridgeError> {
    if snap.services.values().any(|s| name_of(s) == Some(service)) {
        Ok(())
    } else {
        Err(BridgeError::NotFound(format!("service '{}'", service)))
    }
}

fn table_definition(snap: &Snapshot, service: &str, table: &str) -> Result<Value, BridgeError> {
    snap.tables
        .get(&(service.to_string(), table.to_string()))
        .cloned()
        .ok_or_else(|| BridgeError::NotFound(format!("table '{}' in service '{}'", table, service)))
}

fn create_tables(snap: &mut Snapshot, service: &str, tables: Vec<Value>) -> Result<Vec<Value>, BridgeError> {
    require_service(snap, service)?;
    let mut names = Vec::with_capacity(tables.len());
    for def in &tables {
        let name = name_of(def).ok_or_else(|| BridgeError::BadRequest("table definition requires 'name'".into()))?;
        let key = (service.to_string(), name.to_string());
        if snap.tables.contains_key(&key) || names.contains(&key) {
            return Err(BridgeError::Conflict(format!("table '{}' already exists in '{}'", name, service)));
        }
        names.push(key);
    }
    let mut created = Vec::with_capacity(tables.len());
    for (key, def) in names.into_iter().zip(tables) {
        created.push(serde_json::json!({ "name": key.1.clone() }));
        snap.records.entry(key.clone()).or_default();
        snap.tables.insert(key, def);
    }
    Ok(created)
}

fn insert_records(snap: &mut Snapshot, service: &str, table: &str, records: Vec<Value>) -> Result<Vec<Value>, BridgeError> {
    require_service(snap, service)?;
    table_definition(snap, service, table)?;
    let rows = snap.records.entry((service.to_string(), table.to_string())).or_default();
    rows.extend(records.iter().cloned());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SYSTEM_SERVICE;
    use serde_json::json;

    async fn store_with_db() -> MemoryMetadataStore {
        let store = MemoryMetadataStore::default();
        store
            .seed_service(json!({"name": "db1", "type": "sql_db"}))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn created_apps_get_sequential_ids() {
        let store = MemoryMetadataStore::default();
        store.set_next_ids(42, 1).await;
        let out = store
            .handle_request(BridgeRequest::post(SYSTEM_SERVICE, "app", json!({"resource": [{"name": "todo"}]})))
            .await
            .unwrap();
        assert_eq!(out["resource"][0]["id"], json!(42));
        let app = store.handle_request(BridgeRequest::get(SYSTEM_SERVICE, "app/42")).await.unwrap();
        assert_eq!(app["name"], json!("todo"));
    }

    #[tokio::test]
    async fn duplicate_names_conflict_without_partial_insert() {
        let store = MemoryMetadataStore::default();
        store.seed_app(json!({"name": "todo"})).await.unwrap();
        let err = store
            .handle_request(BridgeRequest::post(
                SYSTEM_SERVICE,
                "app",
                json!({"resource": [{"name": "other"}, {"name": "todo"}]}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        assert_eq!(store.app_count().await, 1);
    }

    #[tokio::test]
    async fn transaction_is_invisible_until_commit() {
        let store = store_with_db().await;
        let tx = store.begin().await.unwrap();
        tx.handle_request(BridgeRequest::post("db1", "_schema", json!({"resource": [{"name": "orders"}]})))
            .await
            .unwrap();
        assert!(store.table_names("db1").await.is_empty());
        tx.commit().await.unwrap();
        assert_eq!(store.table_names("db1").await, vec!["orders"]);

        let tx = store.begin().await.unwrap();
        tx.handle_request(BridgeRequest::post("db1", "_table/orders", json!({"resource": [{"id": 1}]})))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert!(store.records("db1", "orders").await.is_empty());
    }

    #[tokio::test]
    async fn schema_reads_by_ids_and_missing_table_is_not_found() {
        let store = store_with_db().await;
        store.seed_table("db1", json!({"name": "orders", "field": []})).await.unwrap();
        let out = store
            .handle_request(BridgeRequest::get("db1", "_schema").with_query("ids", "orders"))
            .await
            .unwrap();
        assert_eq!(out["resource"][0]["name"], json!("orders"));
        let err = store
            .handle_request(BridgeRequest::get("db1", "_schema").with_query("ids", "orders,nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        let err = store
            .handle_request(BridgeRequest::post("db9", "_schema", json!({"resource": [{"name": "t"}]})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_faults_fire_and_requests_are_logged() {
        let store = store_with_db().await;
        store.seed_table("db1", json!({"name": "orders"})).await.unwrap();
        store
            .fail_on(Verb::Post, "db1", "_table", BridgeError::Conflict("dup".into()))
            .await;
        let err = store
            .handle_request(BridgeRequest::post("db1", "_table/orders", json!({"resource": [{"id": 1}]})))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Conflict("dup".into()));
        assert_eq!(store.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_limit() {
        let store = MemoryMetadataStore::new(ResourceEnvelope::new("resource", false));
        store.seed_service(json!({"name": "a", "type": "sql_db"})).await.unwrap();
        store.seed_service(json!({"name": "files", "type": "local_file"})).await.unwrap();
        store.seed_service(json!({"name": "s3", "type": "local_file"})).await.unwrap();
        let out = store
            .handle_request(
                BridgeRequest::get(SYSTEM_SERVICE, "service")
                    .with_query("type", "local_file")
                    .with_query("limit", "1"),
            )
            .await
            .unwrap();
        let rows = out.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("files"));
        assert_eq!(rows[0]["id"], json!(2));
        assert!(rows[0]["created_date"].is_string());
    }

    #[tokio::test]
    async fn unsupported_verbs_are_rejected() {
        let store = MemoryMetadataStore::default();
        let mut req = BridgeRequest::get(SYSTEM_SERVICE, "app");
        req.verb = Verb::Delete;
        let err = store.handle_request(req).await.unwrap_err();
        assert_eq!(err.status(), 405);
    }

    fn app_post(name: &str) -> BridgeRequest {
        BridgeRequest::post(SYSTEM_SERVICE, "app", json!({"resource": [{"name": name}]}))
    }

    #[tokio::test]
    async fn overlapping_transactions_never_drop_committed_apps() {
        let store = MemoryMetadataStore::default();
        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();

        first.handle_request(app_post("a")).await.unwrap();
        first.commit().await.unwrap();

        second.handle_request(app_post("b")).await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));

        assert_eq!(store.app_count().await, 1);
        let apps = store.handle_request(BridgeRequest::get(SYSTEM_SERVICE, "app")).await.unwrap();
        assert_eq!(apps["resource"][0]["name"], json!("a"));
    }

    #[tokio::test]
    async fn autocommit_write_during_transaction_survives() {
        let store = MemoryMetadataStore::default();
        let tx = store.begin().await.unwrap();
        store.handle_request(app_post("x")).await.unwrap();

        tx.handle_request(app_post("a")).await.unwrap();
        assert!(matches!(tx.commit().await, Err(BridgeError::Conflict(_))));
        assert_eq!(store.app_count().await, 1);
    }

    #[tokio::test]
    async fn read_only_transaction_commits_after_concurrent_write() {
        let store = MemoryMetadataStore::default();
        let tx = store.begin().await.unwrap();
        tx.handle_request(BridgeRequest::get(SYSTEM_SERVICE, "app")).await.unwrap();
        store.handle_request(app_post("x")).await.unwrap();

        tx.commit().await.unwrap();
        assert_eq!(store.app_count().await, 1);
    }
}
