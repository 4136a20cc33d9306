//! In-memory Stockline API stand-in for integration tests.
//!
//! Speaks the subset of the hosted API the client exercises: the generic
//! model RPC surface, collection find/create, wizard and report endpoints,
//! task polling and the password login handshake. Rows are stored as raw
//! JSON, so typed envelopes pass through untouched.
//!
//! Conventions the tests rely on:
//! - any credential containing `expired` is rejected with 401;
//! - the `boom` entity answers 500 with an `X-Sentry-ID` header;
//! - creating a `contact` without a `name` is a user error;
//! - the only login accepted is `admin` / `admin`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

type JsonMap = serde_json::Map<String, Value>;

#[derive(Default)]
struct EntityStore {
    rows: BTreeMap<i64, JsonMap>,
    next_id: i64,
}

impl EntityStore {
    fn insert(&mut self, mut row: JsonMap) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        row.insert("id".to_string(), json!(id));
        self.rows.insert(id, row);
        id
    }
}

struct TaskSim {
    token: String,
    polls: u32,
}

#[derive(Default)]
pub struct Store {
    models: HashMap<String, EntityStore>,
    wizard_sessions: HashMap<i64, u32>,
    next_wizard_id: i64,
    tasks: HashMap<String, TaskSim>,
}

impl Store {
    fn entity(&mut self, name: &str) -> &mut EntityStore {
        self.models.entry(name.to_string()).or_default()
    }
}

pub type Db = Arc<RwLock<Store>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Store::default()));
    let api = Router::new()
        .route("/model/{entity}", get(find).post(create))
        .route("/model/{entity}/{tail}", get(point_read).put(entity_rpc))
        .route("/model/{entity}/{id}/{method}", put(instance_rpc))
        .route("/wizard/{name}/{action}", put(wizard))
        .route("/report/{name}", put(report))
        .route("/async-result", post(async_result))
        .layer(middleware::from_fn(require_auth));
    Router::new()
        .route("/", post(login))
        .nest("/api/v1", api.clone())
        .nest("/api/v2", api)
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

// --- auth ---

fn credentials_ok(headers: &HeaderMap) -> bool {
    let fresh = |value: &header::HeaderValue| {
        value
            .to_str()
            .map(|text| !text.is_empty() && !text.contains("expired"))
            .unwrap_or(false)
    };
    headers.get("x-api-key").map(fresh).unwrap_or(false)
        || headers.get(header::AUTHORIZATION).map(fresh).unwrap_or(false)
}

async fn require_auth(request: Request, next: Next) -> Response {
    if !credentials_ok(request.headers()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"type": "UnauthorizedError", "message": "invalid credentials"})),
        )
            .into_response();
    }
    next.run(request).await
}

// --- login ---

#[derive(Deserialize)]
struct LoginRequest {
    method: String,
    params: (String, String),
}

async fn login(Json(input): Json<LoginRequest>) -> Response {
    if input.method != "common.db.login" {
        return bad_request("unknown method");
    }
    let (login, password) = input.params;
    if login == "admin" && password == "admin" {
        Json(json!({"result": [1, Uuid::new_v4().to_string()]})).into_response()
    } else {
        Json(json!({"result": null})).into_response()
    }
}

// --- collection resource ---

async fn find(
    State(db): State<Db>,
    Path(entity): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if entity == "boom" {
        return server_boom();
    }
    let params = FindParams::parse(&params);
    let mut store = db.write().await;
    let rows = matching_rows(store.entity(&entity), &params.filter, params.active_test);
    let mut rows = ordered(rows, params.order.as_ref());
    let start = (params.page.saturating_sub(1)) * params.per_page;
    rows = rows
        .into_iter()
        .skip(start)
        .take(params.per_page)
        .collect();
    let projected: Vec<JsonMap> = rows
        .into_iter()
        .map(|row| project(&row, &params.fields))
        .collect();
    Json(projected).into_response()
}

async fn create(
    State(db): State<Db>,
    Path(entity): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if entity == "boom" {
        return server_boom();
    }
    let Some(items) = body.as_array() else {
        return bad_request("create expects a list of records");
    };
    let mut store = db.write().await;
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let Some(row) = item.as_object() else {
            return bad_request("records must be objects");
        };
        if entity == "contact" && !row.contains_key("name") {
            return user_error("Name is required", "required_field");
        }
        ids.push(store.entity(&entity).insert(row.clone()));
    }
    Json(json!(ids)).into_response()
}

async fn point_read(
    State(db): State<Db>,
    Path((entity, tail)): Path<(String, String)>,
) -> Response {
    if entity == "boom" {
        return server_boom();
    }
    let Ok(id) = tail.parse::<i64>() else {
        return bad_request("record id must be an integer");
    };
    let mut store = db.write().await;
    match store.entity(&entity).rows.get(&id) {
        Some(row) => Json(row.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "record not found"})),
        )
            .into_response(),
    }
}

// --- model RPC ---

async fn entity_rpc(
    State(db): State<Db>,
    Path((entity, method)): Path<(String, String)>,
    Query(params): Query<Vec<(String, String)>>,
    Json(args): Json<Value>,
) -> Response {
    if entity == "boom" {
        return server_boom();
    }
    let args = args.as_array().cloned().unwrap_or_default();
    let active_test = params
        .iter()
        .find(|(key, _)| key == "context")
        .map(|(_, value)| active_test_from(value))
        .unwrap_or(true);
    let mut store = db.write().await;
    match method.as_str() {
        "search" => {
            let clauses = clauses_arg(args.first());
            let rows = matching_rows(store.entity(&entity), &clauses, active_test);
            let rows = ordered(rows, args.get(3).filter(|v| !v.is_null()));
            let ids: Vec<i64> = windowed(rows, args.get(1), args.get(2))
                .into_iter()
                .filter_map(|row| row.get("id").and_then(Value::as_i64))
                .collect();
            Json(json!(ids)).into_response()
        }
        "search_count" => {
            let clauses = clauses_arg(args.first());
            let rows = matching_rows(store.entity(&entity), &clauses, active_test);
            Json(json!(rows.len())).into_response()
        }
        "search_read" => {
            let clauses = clauses_arg(args.first());
            let fields = fields_arg(args.get(4));
            let rows = matching_rows(store.entity(&entity), &clauses, active_test);
            let rows = ordered(rows, args.get(3).filter(|v| !v.is_null()));
            let projected: Vec<JsonMap> = windowed(rows, args.get(1), args.get(2))
                .into_iter()
                .map(|row| project(&row, &fields))
                .collect();
            Json(projected).into_response()
        }
        "read" => {
            let ids = ids_arg(args.first());
            let fields = fields_arg(args.get(1));
            let entity_store = store.entity(&entity);
            let rows: Vec<JsonMap> = ids
                .iter()
                .filter_map(|id| entity_store.rows.get(id))
                .map(|row| project(row, &fields))
                .collect();
            Json(rows).into_response()
        }
        "write" => {
            let ids = ids_arg(args.first());
            let values = args
                .get(1)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let entity_store = store.entity(&entity);
            for id in ids {
                if let Some(row) = entity_store.rows.get_mut(&id) {
                    for (key, value) in &values {
                        row.insert(key.clone(), value.clone());
                    }
                }
            }
            Json(json!(true)).into_response()
        }
        "delete" => {
            let ids = ids_arg(args.first());
            let entity_store = store.entity(&entity);
            for id in ids {
                entity_store.rows.remove(&id);
            }
            Json(json!(true)).into_response()
        }
        "get_preferences" => Json(json!({
            "locale": "en_US",
            "company": 1,
            "company_name": "Acme Industries",
        }))
        .into_response(),
        "add_attachment_from_url" => {
            let mut row = JsonMap::new();
            for (slot, key) in ["filename", "url", "resource"].iter().enumerate() {
                row.insert(
                    key.to_string(),
                    args.get(slot).cloned().unwrap_or(Value::Null),
                );
            }
            let resource_ok = row
                .get("resource")
                .and_then(Value::as_str)
                .map(|r| r.contains(','))
                .unwrap_or(false);
            if !resource_ok {
                return bad_request("resource must be 'entity,id'");
            }
            let id = store.entity("attachment").insert(row);
            Json(json!(id)).into_response()
        }
        _ => bad_request("unknown method"),
    }
}

async fn instance_rpc(
    State(db): State<Db>,
    Path((entity, id, method)): Path<(String, i64, String)>,
    Json(args): Json<Value>,
) -> Response {
    if entity == "boom" {
        return server_boom();
    }
    let mut store = db.write().await;
    if !store.entity(&entity).rows.contains_key(&id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "record not found"})),
        )
            .into_response();
    }
    if method == "start_export" {
        let task_id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().to_string();
        store.tasks.insert(
            task_id.clone(),
            TaskSim {
                token: token.clone(),
                polls: 0,
            },
        );
        return Json(json!({
            "__class__": "AsyncResult",
            "task_id": task_id,
            "token": token,
        }))
        .into_response();
    }
    Json(json!({"method": method, "id": id, "args": args})).into_response()
}

// --- wizards ---

async fn wizard(
    State(db): State<Db>,
    Path((name, action)): Path<(String, String)>,
    Json(args): Json<Value>,
) -> Response {
    let args = args.as_array().cloned().unwrap_or_default();
    let mut store = db.write().await;
    match action.as_str() {
        "create" => {
            store.next_wizard_id += 1;
            let sid = store.next_wizard_id;
            store.wizard_sessions.insert(sid, 0);
            Json(json!([sid, "start", "end"])).into_response()
        }
        "execute" => {
            let Some(sid) = args.first().and_then(Value::as_i64) else {
                return bad_request("wizard session id missing");
            };
            let Some(executions) = store.wizard_sessions.get_mut(&sid) else {
                return bad_request("unknown wizard session");
            };
            *executions += 1;
            if *executions == 1 {
                // First transition pauses for input.
                return Json(json!({
                    "view": {"state": "start", "defaults": {"qty": 1}},
                }))
                .into_response();
            }
            let qty = args
                .get(1)
                .and_then(|data| data.get("start"))
                .and_then(|start| start.get("qty"))
                .cloned()
                .unwrap_or(json!(0));
            Json(json!({"wizard": name, "processed": qty})).into_response()
        }
        "delete" => {
            let Some(sid) = args.first().and_then(Value::as_i64) else {
                return bad_request("wizard session id missing");
            };
            store.wizard_sessions.remove(&sid);
            Json(json!(null)).into_response()
        }
        _ => bad_request("unknown wizard action"),
    }
}

// --- reports ---

// The free-form `data` map in the body is accepted and ignored.
#[derive(Deserialize)]
struct ReportRequest {
    objects: Vec<i64>,
}

async fn report(Path(name): Path<String>, Json(input): Json<ReportRequest>) -> Response {
    let rendered = format!("{}:{}", name, input.objects.len());
    Json(json!({
        "__class__": "bytes",
        "base64": BASE64.encode(rendered.as_bytes()),
    }))
    .into_response()
}

// --- task polling ---

#[derive(Deserialize)]
struct PollRequest {
    tasks: Vec<(String, String)>,
}

/// Every task runs the same script: STARTED on the first poll, SUCCESS with
/// a result on every poll after that.
async fn async_result(State(db): State<Db>, Json(input): Json<PollRequest>) -> Response {
    let mut store = db.write().await;
    let mut entries = Vec::with_capacity(input.tasks.len());
    for (task_id, token) in input.tasks {
        let entry = match store.tasks.get_mut(&task_id) {
            Some(task) if task.token == token => {
                task.polls += 1;
                if task.polls == 1 {
                    json!({"state": "STARTED"})
                } else {
                    json!({"state": "SUCCESS", "result": 42})
                }
            }
            _ => json!({"error": "unknown task"}),
        };
        entries.push(entry);
    }
    Json(json!({"tasks": entries})).into_response()
}

// --- responses ---

fn user_error(message: &str, code: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "type": "UserError",
            "message": message,
            "code": code,
            "description": "",
        })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"message": message})),
    )
        .into_response()
}

fn server_boom() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [("x-sentry-id", "snt-123")],
        "kaboom",
    )
        .into_response()
}

// --- query evaluation ---

#[derive(Debug)]
struct FindParams {
    filter: Vec<Value>,
    page: usize,
    per_page: usize,
    fields: Vec<String>,
    order: Option<Value>,
    active_test: bool,
}

impl FindParams {
    fn parse(params: &[(String, String)]) -> FindParams {
        let mut out = FindParams {
            filter: Vec::new(),
            page: 1,
            per_page: 10,
            fields: Vec::new(),
            order: None,
            active_test: true,
        };
        for (key, value) in params {
            match key.as_str() {
                "filter" => {
                    out.filter = serde_json::from_str::<Value>(value)
                        .ok()
                        .and_then(|v| v.as_array().cloned())
                        .unwrap_or_default();
                }
                "page" => out.page = value.parse().unwrap_or(1),
                "per_page" => out.per_page = value.parse().unwrap_or(10),
                "field" => out.fields.push(value.clone()),
                "order" => {
                    out.order = serde_json::from_str::<Value>(value)
                        .ok()
                        .filter(|v| !v.is_null());
                }
                "context" => out.active_test = active_test_from(value),
                _ => {}
            }
        }
        out
    }
}

fn active_test_from(context: &str) -> bool {
    serde_json::from_str::<Value>(context)
        .ok()
        .and_then(|ctx| ctx.get("active_test").and_then(Value::as_bool))
        .unwrap_or(true)
}

fn clauses_arg(value: Option<&Value>) -> Vec<Value> {
    value
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn ids_arg(value: Option<&Value>) -> Vec<i64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn fields_arg(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn clause_matches(row: &JsonMap, clause: &Value) -> bool {
    let Some(parts) = clause.as_array() else {
        return false;
    };
    let (Some(field), Some(op), Some(expected)) = (
        parts.first().and_then(Value::as_str),
        parts.get(1).and_then(Value::as_str),
        parts.get(2),
    ) else {
        return false;
    };
    let actual = row.get(field).unwrap_or(&Value::Null);
    match op {
        "=" => actual == expected,
        "!=" => actual != expected,
        "<" => compare(actual, expected) == Some(Ordering::Less),
        "<=" => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ">" => compare(actual, expected) == Some(Ordering::Greater),
        ">=" => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "in" => expected
            .as_array()
            .map(|options| options.contains(actual))
            .unwrap_or(false),
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn row_is_active(row: &JsonMap) -> bool {
    row.get("active").and_then(Value::as_bool).unwrap_or(true)
}

fn matching_rows(store: &EntityStore, clauses: &[Value], active_test: bool) -> Vec<JsonMap> {
    store
        .rows
        .values()
        .filter(|row| !active_test || row_is_active(row))
        .filter(|row| clauses.iter().all(|clause| clause_matches(row, clause)))
        .cloned()
        .collect()
}

fn ordered(mut rows: Vec<JsonMap>, order: Option<&Value>) -> Vec<JsonMap> {
    let Some(first) = order
        .and_then(Value::as_array)
        .and_then(|criteria| criteria.first())
        .and_then(Value::as_array)
    else {
        return rows;
    };
    let Some(field) = first.first().and_then(Value::as_str) else {
        return rows;
    };
    let descending = first
        .get(1)
        .and_then(Value::as_str)
        .map(|dir| dir.eq_ignore_ascii_case("desc"))
        .unwrap_or(false);
    rows.sort_by(|a, b| {
        let (a, b) = (
            a.get(field).unwrap_or(&Value::Null),
            b.get(field).unwrap_or(&Value::Null),
        );
        compare(a, b).unwrap_or(Ordering::Equal)
    });
    if descending {
        rows.reverse();
    }
    rows
}

fn windowed(rows: Vec<JsonMap>, offset: Option<&Value>, limit: Option<&Value>) -> Vec<JsonMap> {
    let offset = offset.and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = limit
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(usize::MAX);
    rows.into_iter().skip(offset).take(limit).collect()
}

fn project(row: &JsonMap, fields: &[String]) -> JsonMap {
    if fields.is_empty() {
        return row.clone();
    }
    let mut out = JsonMap::new();
    if let Some(id) = row.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = row.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}
