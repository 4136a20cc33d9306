//! Proxy for one remote entity type.
//!
//! # Design
//! `Model` is a thin borrow of the session bound to one entity-type name.
//! `call` is the generic RPC spine: any method name routes through it
//! untouched. The named operations (`search`, `read`, `write`, and friends)
//! are specializations that fix the positional argument layout the server
//! expects. `create` and `find` use the collection resource instead of RPC.
//! `search_read_all` walks a result set in bounded strides without loading
//! it whole.

use std::collections::VecDeque;

use tracing::debug;

use crate::codec::{encode_to_string, Value, ValueMap};
use crate::error::{CodecError, Error, Result};
use crate::http::{HttpMethod, HttpRequest};
use crate::session::{Context, Session};

/// Entity type owning uploaded attachments.
const ATTACHMENT_ENTITY: &str = "attachment";

/// One row of a read result, keyed by field name.
pub type Row = ValueMap;

/// Ordering criteria as `(field, direction)` pairs.
pub type Order = Vec<(String, String)>;

/// Ascending criterion for [`Order`].
pub fn asc(field: &str) -> (String, String) {
    (field.to_string(), "ASC".to_string())
}

/// Descending criterion for [`Order`].
pub fn desc(field: &str) -> (String, String) {
    (field.to_string(), "DESC".to_string())
}

fn order_to_value(order: Option<&Order>) -> Value {
    match order {
        Some(criteria) => Value::List(
            criteria
                .iter()
                .map(|(field, direction)| {
                    Value::List(vec![
                        Value::String(field.clone()),
                        Value::String(direction.clone()),
                    ])
                })
                .collect(),
        ),
        None => Value::Null,
    }
}

fn fields_to_value(fields: Option<&[String]>) -> Value {
    match fields {
        Some(names) => Value::List(names.iter().map(|f| Value::String(f.clone())).collect()),
        None => Value::Null,
    }
}

fn ids_to_value(ids: &[i64]) -> Value {
    Value::List(ids.iter().map(|id| Value::Int(*id)).collect())
}

fn opt_u64(value: Option<u64>) -> Value {
    match value {
        Some(n) => Value::Int(n as i64),
        None => Value::Null,
    }
}

/// Filter clauses combined with an implicit AND.
///
/// Each clause is `[field, operator, value]` on the wire; `push_clause` is
/// the escape hatch for vendor-specific nestings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Domain {
    clauses: Vec<Value>,
}

impl Domain {
    /// The empty domain: matches every record.
    pub fn all() -> Domain {
        Domain::default()
    }

    pub fn filter(field: &str, operator: &str, value: impl Into<Value>) -> Domain {
        Domain::all().and(field, operator, value)
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Domain {
        Domain::filter(field, "=", value)
    }

    pub fn and(mut self, field: &str, operator: &str, value: impl Into<Value>) -> Domain {
        self.clauses.push(Value::List(vec![
            Value::String(field.to_string()),
            Value::String(operator.to_string()),
            value.into(),
        ]));
        self
    }

    pub fn and_eq(self, field: &str, value: impl Into<Value>) -> Domain {
        self.and(field, "=", value)
    }

    /// Append a pre-built clause verbatim.
    pub fn push_clause(&mut self, clause: Value) {
        self.clauses.push(clause);
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::List(self.clauses.clone())
    }
}

/// Paging and projection knobs for [`Model::find`].
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub page: u64,
    pub per_page: u64,
    pub fields: Option<Vec<String>>,
    pub order: Option<Order>,
}

impl Default for FindOptions {
    fn default() -> Self {
        FindOptions {
            page: 1,
            per_page: 10,
            fields: None,
            order: None,
        }
    }
}

/// Paging knobs for [`Model::search_read_all`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Rows fetched per remote call.
    pub batch_size: u64,
    /// First row offset of the walk.
    pub offset: u64,
    /// Total row bound; unbounded walks count first.
    pub limit: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            batch_size: 500,
            offset: 0,
            limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Model<'a> {
    session: &'a Session,
    name: String,
}

impl<'a> Model<'a> {
    pub(crate) fn new(session: &'a Session, name: String) -> Self {
        Model { session, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn collection_url(&self) -> String {
        format!("{}/model/{}", self.session.base_url(), self.name)
    }

    /// Generic RPC: PUT the positional args to the method path.
    pub fn call(&self, method: &str, args: &[Value], ctx: Option<&Context>) -> Result<Value> {
        debug!(entity = %self.name, method, "rpc");
        let mut request = HttpRequest::new(
            HttpMethod::Put,
            format!("{}/{}", self.collection_url(), method),
        );
        request.body = Some(encode_to_string(&Value::List(args.to_vec())));
        self.session.attach_context(&mut request, ctx);
        self.session.execute(request)
    }

    /// Instance-scoped RPC: PUT the positional args to the record's method
    /// path.
    pub fn call_record(
        &self,
        id: i64,
        method: &str,
        args: &[Value],
        ctx: Option<&Context>,
    ) -> Result<Value> {
        debug!(entity = %self.name, id, method, "rpc");
        let mut request = HttpRequest::new(
            HttpMethod::Put,
            format!("{}/{id}/{method}", self.collection_url()),
        );
        request.body = Some(encode_to_string(&Value::List(args.to_vec())));
        self.session.attach_context(&mut request, ctx);
        self.session.execute(request)
    }

    /// Point read of one record, every field included.
    pub fn get(&self, id: i64, ctx: Option<&Context>) -> Result<Row> {
        let mut request =
            HttpRequest::new(HttpMethod::Get, format!("{}/{id}", self.collection_url()));
        self.session.attach_context(&mut request, ctx);
        match self.session.execute(request)? {
            Value::Map(row) => Ok(row),
            other => Err(malformed_response(format!(
                "expected a record map, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Paginated, filtered collection read.
    pub fn find(
        &self,
        filter: Option<&Domain>,
        options: &FindOptions,
        ctx: Option<&Context>,
    ) -> Result<Vec<Row>> {
        let mut request = HttpRequest::new(HttpMethod::Get, self.collection_url());
        let filter_value = filter.map(Domain::to_value).unwrap_or(Value::List(Vec::new()));
        request
            .query
            .push(("filter".to_string(), encode_to_string(&filter_value)));
        request
            .query
            .push(("page".to_string(), options.page.to_string()));
        request
            .query
            .push(("per_page".to_string(), options.per_page.to_string()));
        if let Some(fields) = &options.fields {
            for field in fields {
                request.query.push(("field".to_string(), field.clone()));
            }
        }
        request.query.push((
            "order".to_string(),
            encode_to_string(&order_to_value(options.order.as_ref())),
        ));
        self.session.attach_context(&mut request, ctx);
        expect_rows(self.session.execute(request)?)
    }

    /// Create records through the collection resource; returns the new ids
    /// in input order.
    pub fn create(&self, records: &[ValueMap], ctx: Option<&Context>) -> Result<Vec<i64>> {
        debug!(entity = %self.name, count = records.len(), "create");
        let mut request = HttpRequest::new(HttpMethod::Post, self.collection_url());
        let body = Value::List(records.iter().cloned().map(Value::Map).collect());
        request.body = Some(encode_to_string(&body));
        self.session.attach_context(&mut request, ctx);
        expect_ids(self.session.execute(request)?)
    }

    pub fn search(
        &self,
        domain: &Domain,
        offset: Option<u64>,
        limit: Option<u64>,
        order: Option<&Order>,
        ctx: Option<&Context>,
    ) -> Result<Vec<i64>> {
        let args = [
            domain.to_value(),
            opt_u64(offset),
            opt_u64(limit),
            order_to_value(order),
        ];
        expect_ids(self.call("search", &args, ctx)?)
    }

    pub fn search_count(&self, domain: &Domain, ctx: Option<&Context>) -> Result<u64> {
        match self.call("search_count", &[domain.to_value()], ctx)? {
            Value::Int(n) if n >= 0 => Ok(n as u64),
            other => Err(malformed_response(format!(
                "expected a count, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn search_read(
        &self,
        domain: &Domain,
        offset: Option<u64>,
        limit: Option<u64>,
        order: Option<&Order>,
        fields: Option<&[String]>,
        ctx: Option<&Context>,
    ) -> Result<Vec<Row>> {
        let args = [
            domain.to_value(),
            opt_u64(offset),
            opt_u64(limit),
            order_to_value(order),
            fields_to_value(fields),
        ];
        expect_rows(self.call("search_read", &args, ctx)?)
    }

    pub fn read(
        &self,
        ids: &[i64],
        fields: Option<&[String]>,
        ctx: Option<&Context>,
    ) -> Result<Vec<Row>> {
        let args = [ids_to_value(ids), fields_to_value(fields)];
        expect_rows(self.call("read", &args, ctx)?)
    }

    pub fn write(&self, ids: &[i64], values: &ValueMap, ctx: Option<&Context>) -> Result<Value> {
        let args = [ids_to_value(ids), Value::Map(values.clone())];
        self.call("write", &args, ctx)
    }

    pub fn delete(&self, ids: &[i64], ctx: Option<&Context>) -> Result<()> {
        self.call("delete", &[ids_to_value(ids)], ctx)?;
        Ok(())
    }

    /// Stream a result set lazily in bounded strides.
    ///
    /// Nothing is fetched until the first pull. When no limit is given, one
    /// `search_count` fixes the extent of the walk up front; rows shifting
    /// underneath a running walk are an accepted race, and an empty stride
    /// ends it early. After yielding an error the iterator is fused.
    pub fn search_read_all(
        &self,
        domain: Domain,
        order: Option<Order>,
        fields: Option<Vec<String>>,
        options: StreamOptions,
        ctx: Option<&Context>,
    ) -> SearchReadAll<'a> {
        SearchReadAll {
            model: self.clone(),
            domain,
            order,
            fields,
            context: ctx.cloned(),
            batch_size: options.batch_size.max(1),
            offset: options.offset,
            limit: options.limit,
            pos: 0,
            end: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Attach a file by URL to one record of this entity type.
    ///
    /// Defers to the attachment entity's upload method; the target record is
    /// addressed with the composite `"{entity_type},{id}"` string.
    pub fn attach(&self, id: i64, filename: &str, url: &str) -> Result<Value> {
        self.session.model(ATTACHMENT_ENTITY).call(
            "add_attachment_from_url",
            &[
                Value::from(filename),
                Value::from(url),
                Value::from(format!("{},{id}", self.name)),
            ],
            None,
        )
    }
}

pub(crate) fn malformed_response(reason: String) -> Error {
    Error::Codec(CodecError::malformed("response", reason))
}

fn expect_rows(value: Value) -> Result<Vec<Row>> {
    let items = match value {
        Value::List(items) => items,
        other => {
            return Err(malformed_response(format!(
                "expected a list of rows, got {}",
                other.kind_name()
            )))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Map(row) => Ok(row),
            other => Err(malformed_response(format!(
                "expected a row map, got {}",
                other.kind_name()
            ))),
        })
        .collect()
}

fn expect_ids(value: Value) -> Result<Vec<i64>> {
    let items = match value {
        Value::List(items) => items,
        other => {
            return Err(malformed_response(format!(
                "expected a list of ids, got {}",
                other.kind_name()
            )))
        }
    };
    items
        .into_iter()
        .map(|item| {
            item.as_i64().ok_or_else(|| {
                malformed_response(format!("expected an id, got {}", item.kind_name()))
            })
        })
        .collect()
}

/// Lazy strided walk over a search result. See [`Model::search_read_all`].
pub struct SearchReadAll<'a> {
    model: Model<'a>,
    domain: Domain,
    order: Option<Order>,
    fields: Option<Vec<String>>,
    context: Option<Context>,
    batch_size: u64,
    offset: u64,
    limit: Option<u64>,
    pos: u64,
    end: Option<u64>,
    buffer: VecDeque<Row>,
    done: bool,
}

impl Iterator for SearchReadAll<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            let end = match self.end {
                Some(end) => end,
                None => {
                    let end = match self.limit {
                        Some(limit) => self.offset.saturating_add(limit),
                        None => {
                            match self
                                .model
                                .search_count(&self.domain, self.context.as_ref())
                            {
                                Ok(count) => self.offset.saturating_add(count),
                                Err(err) => {
                                    self.done = true;
                                    return Some(Err(err));
                                }
                            }
                        }
                    };
                    self.pos = self.offset;
                    self.end = Some(end);
                    end
                }
            };
            if self.pos >= end {
                self.done = true;
                return None;
            }
            let stride = self.batch_size.min(end - self.pos);
            let batch = self.model.search_read(
                &self.domain,
                Some(self.pos),
                Some(stride),
                self.order.as_ref(),
                self.fields.as_deref(),
                self.context.as_ref(),
            );
            match batch {
                Ok(rows) => {
                    self.pos += stride;
                    if rows.is_empty() {
                        // The store shrank underneath the walk.
                        self.done = true;
                        return None;
                    }
                    self.buffer.extend(rows);
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::auth::Auth;
    use crate::http::testing::{status, FakeTransport};

    fn session_with(fake: &Rc<FakeTransport>) -> Session {
        Session::new("acme")
            .with_auth(Auth::api_key("k"))
            .with_transport(Box::new(fake.clone()))
    }

    fn body_json(request: &HttpRequest) -> serde_json::Value {
        serde_json::from_str(request.body.as_deref().unwrap()).unwrap()
    }

    fn rows_body(range: std::ops::Range<i64>) -> String {
        let rows: Vec<serde_json::Value> = range
            .map(|id| serde_json::json!({"id": id, "name": format!("row-{id}")}))
            .collect();
        serde_json::Value::Array(rows).to_string()
    }

    #[test]
    fn call_puts_args_to_method_path() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("42");
        let session = session_with(&fake);
        let result = session
            .model("sale.order")
            .call("confirm", &[Value::Int(3)], None)
            .unwrap();
        assert_eq!(result, Value::Int(42));

        let sent = &fake.requests()[0];
        assert_eq!(sent.method, HttpMethod::Put);
        assert_eq!(
            sent.url,
            "https://acme.stockline.io/api/v1/model/sale.order/confirm"
        );
        assert_eq!(body_json(sent), serde_json::json!([3]));
        assert_eq!(sent.query_param("context"), Some("{}"));
    }

    #[test]
    fn call_merges_contexts_call_site_wins() {
        let fake = Rc::new(FakeTransport::new());
        let mut session = session_with(&fake);
        session
            .context_mut()
            .insert("locale".to_string(), Value::from("en_US"));
        session
            .context_mut()
            .insert("company".to_string(), Value::Int(1));
        let mut overrides = Context::new();
        overrides.insert("company".to_string(), Value::Int(9));
        session
            .model("contact")
            .call("ping", &[], Some(&overrides))
            .unwrap();

        let sent = &fake.requests()[0];
        let ctx: serde_json::Value =
            serde_json::from_str(sent.query_param("context").unwrap()).unwrap();
        assert_eq!(ctx, serde_json::json!({"company": 9, "locale": "en_US"}));
    }

    #[test]
    fn call_record_addresses_one_record() {
        let fake = Rc::new(FakeTransport::new());
        let session = session_with(&fake);
        session
            .model("sale.order")
            .call_record(12, "confirm", &[], None)
            .unwrap();
        assert_eq!(
            fake.requests()[0].url,
            "https://acme.stockline.io/api/v1/model/sale.order/12/confirm"
        );
    }

    #[test]
    fn get_point_reads_one_record() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok(r#"{"id": 5, "name": "Jon"}"#);
        let session = session_with(&fake);
        let row = session.model("contact").get(5, None).unwrap();
        assert_eq!(row["name"], Value::from("Jon"));

        let sent = &fake.requests()[0];
        assert_eq!(sent.method, HttpMethod::Get);
        assert_eq!(sent.url, "https://acme.stockline.io/api/v1/model/contact/5");
    }

    #[test]
    fn get_rejects_non_map_bodies() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("[1, 2]");
        let session = session_with(&fake);
        assert!(matches!(
            session.model("contact").get(5, None).unwrap_err(),
            Error::Codec(_)
        ));
    }

    #[test]
    fn find_sends_filter_paging_fields_and_order() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok(rows_body(1..3));
        let session = session_with(&fake);
        let options = FindOptions {
            page: 2,
            per_page: 50,
            fields: Some(vec!["name".to_string(), "city".to_string()]),
            order: Some(vec![asc("name")]),
        };
        let rows = session
            .model("contact")
            .find(Some(&Domain::eq("city", "Berlin")), &options, None)
            .unwrap();
        assert_eq!(rows.len(), 2);

        let sent = &fake.requests()[0];
        assert_eq!(sent.method, HttpMethod::Get);
        assert_eq!(sent.url, "https://acme.stockline.io/api/v1/model/contact");
        assert_eq!(
            sent.query_param("filter"),
            Some(r#"[["city","=","Berlin"]]"#)
        );
        assert_eq!(sent.query_param("page"), Some("2"));
        assert_eq!(sent.query_param("per_page"), Some("50"));
        assert_eq!(sent.query_param("order"), Some(r#"[["name","ASC"]]"#));
        let fields: Vec<&str> = sent
            .query
            .iter()
            .filter(|(k, _)| k == "field")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(fields, vec!["name", "city"]);
    }

    #[test]
    fn find_defaults_send_empty_filter_and_null_order() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("[]");
        let session = session_with(&fake);
        session
            .model("contact")
            .find(None, &FindOptions::default(), None)
            .unwrap();
        let sent = &fake.requests()[0];
        assert_eq!(sent.query_param("filter"), Some("[]"));
        assert_eq!(sent.query_param("page"), Some("1"));
        assert_eq!(sent.query_param("per_page"), Some("10"));
        assert_eq!(sent.query_param("order"), Some("null"));
        assert!(!sent.query.iter().any(|(k, _)| k == "field"));
    }

    #[test]
    fn create_posts_to_collection_and_parses_ids() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("[11, 12]");
        let session = session_with(&fake);
        let mut first = ValueMap::new();
        first.insert("name".to_string(), Value::from("Jon Doe"));
        let mut second = ValueMap::new();
        second.insert("name".to_string(), Value::from("Jane Doe"));
        let ids = session
            .model("contact")
            .create(&[first, second], None)
            .unwrap();
        assert_eq!(ids, vec![11, 12]);

        let sent = &fake.requests()[0];
        assert_eq!(sent.method, HttpMethod::Post);
        assert_eq!(sent.url, "https://acme.stockline.io/api/v1/model/contact");
        assert_eq!(
            body_json(sent),
            serde_json::json!([{"name": "Jon Doe"}, {"name": "Jane Doe"}])
        );
    }

    #[test]
    fn search_read_sends_positional_args() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("[]");
        let session = session_with(&fake);
        session
            .model("contact")
            .search_read(
                &Domain::eq("active", true),
                Some(10),
                Some(5),
                Some(&vec![desc("id")]),
                Some(&["name".to_string()]),
                None,
            )
            .unwrap();
        assert_eq!(
            body_json(&fake.requests()[0]),
            serde_json::json!([[["active", "=", true]], 10, 5, [["id", "DESC"]], ["name"]])
        );
    }

    #[test]
    fn write_and_delete_route_through_rpc() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("true");
        fake.push_ok("true");
        let session = session_with(&fake);
        let mut values = ValueMap::new();
        values.insert("active".to_string(), Value::Bool(false));
        session.model("contact").write(&[1, 2], &values, None).unwrap();
        session.model("contact").delete(&[1, 2], None).unwrap();

        let requests = fake.requests();
        assert!(requests[0].url.ends_with("/model/contact/write"));
        assert_eq!(
            body_json(&requests[0]),
            serde_json::json!([[1, 2], {"active": false}])
        );
        assert!(requests[1].url.ends_with("/model/contact/delete"));
        assert_eq!(body_json(&requests[1]), serde_json::json!([[1, 2]]));
    }

    #[test]
    fn search_read_all_is_lazy() {
        let fake = Rc::new(FakeTransport::new());
        let session = session_with(&fake);
        let model = session.model("contact");
        let _iter = model.search_read_all(
            Domain::all(),
            None,
            None,
            StreamOptions::default(),
            None,
        );
        assert_eq!(fake.request_count(), 0);
    }

    #[test]
    fn search_read_all_with_limit_strides_without_counting() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok(rows_body(5..10));
        fake.push_ok(rows_body(10..15));
        let session = session_with(&fake);
        let model = session.model("contact");
        let rows: Vec<Row> = model
            .search_read_all(
                Domain::all(),
                None,
                None,
                StreamOptions {
                    batch_size: 5,
                    offset: 5,
                    limit: Some(10),
                },
                None,
            )
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0]["id"], Value::Int(5));
        assert_eq!(rows[9]["id"], Value::Int(14));

        let requests = fake.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.ends_with("/model/contact/search_read"));
        let first = body_json(&requests[0]);
        assert_eq!((first[1].clone(), first[2].clone()), (5.into(), 5.into()));
        let second = body_json(&requests[1]);
        assert_eq!((second[1].clone(), second[2].clone()), (10.into(), 5.into()));
    }

    #[test]
    fn search_read_all_counts_first_when_unbounded_and_shrinks_final_stride() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("7");
        fake.push_ok(rows_body(0..5));
        fake.push_ok(rows_body(5..7));
        let session = session_with(&fake);
        let model = session.model("contact");
        let rows: Vec<Row> = model
            .search_read_all(
                Domain::all(),
                None,
                None,
                StreamOptions {
                    batch_size: 5,
                    offset: 0,
                    limit: None,
                },
                None,
            )
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 7);

        let requests = fake.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].url.ends_with("/model/contact/search_count"));
        let last = body_json(&requests[2]);
        assert_eq!((last[1].clone(), last[2].clone()), (5.into(), 2.into()));
    }

    #[test]
    fn search_read_all_stops_on_empty_batch() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_ok("10");
        fake.push_ok("[]");
        let session = session_with(&fake);
        let model = session.model("contact");
        let rows: Vec<Row> = model
            .search_read_all(
                Domain::all(),
                None,
                None,
                StreamOptions {
                    batch_size: 5,
                    offset: 0,
                    limit: None,
                },
                None,
            )
            .collect::<Result<_>>()
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(fake.request_count(), 2);
    }

    #[test]
    fn search_read_all_yields_error_once_then_fuses() {
        let fake = Rc::new(FakeTransport::new());
        fake.push_response(status(500, "boom"));
        let session = session_with(&fake);
        let model = session.model("contact");
        let mut iter = model.search_read_all(
            Domain::all(),
            None,
            None,
            StreamOptions {
                batch_size: 5,
                offset: 0,
                limit: Some(10),
            },
            None,
        );
        assert!(matches!(iter.next(), Some(Err(Error::Server { .. }))));
        assert!(iter.next().is_none());
        assert_eq!(fake.request_count(), 1);
    }

    #[test]
    fn attach_composes_the_target_string() {
        let fake = Rc::new(FakeTransport::new());
        let session = session_with(&fake);
        session
            .model("contact")
            .attach(7, "photo.png", "https://cdn/photo.png")
            .unwrap();

        let sent = &fake.requests()[0];
        assert!(sent
            .url
            .ends_with("/model/attachment/add_attachment_from_url"));
        assert_eq!(
            body_json(sent),
            serde_json::json!(["photo.png", "https://cdn/photo.png", "contact,7"])
        );
    }
}
