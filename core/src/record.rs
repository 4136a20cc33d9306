//! Schema-aware records over the RPC surface.
//!
//! # Design
//! A [`Record`] is a tracked row paired with a shared [`Schema`] handle.
//! Field access goes through the schema, so typos and type mismatches fail
//! locally instead of producing a confusing server error. Lifecycle calls
//! (`save`, `refresh`, `delete`) and relation traversal take the
//! [`Registry`] explicitly; records themselves stay plain data and never
//! hold a session borrow.
//!
//! The registry also owns the optional cache backend. Reads through
//! `from_cache` are read-through: a miss fetches the eager fields remotely
//! and stores the encoded row under `"{account}:{entity}:{id}"`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::warn;

use crate::cache::CacheBackend;
use crate::codec::{encode_to_string, Value, ValueMap};
use crate::error::{Error, Result};
use crate::model::{malformed_response, Domain, Model, Order, Row};
use crate::query::Query;
use crate::schema::{FieldDef, FieldKind, Schema};
use crate::session::Session;

/// Row values plus the set of keys written since the last sync.
///
/// A write only marks a key dirty when it introduces a new key or changes
/// the stored value; once dirty, a key stays dirty until the row is
/// replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedRow {
    values: ValueMap,
    dirty: BTreeSet<String>,
}

impl TrackedRow {
    /// Wrap already-synced values; nothing starts dirty.
    pub fn new(values: ValueMap) -> Self {
        TrackedRow {
            values,
            dirty: BTreeSet::new(),
        }
    }

    pub fn empty() -> Self {
        TrackedRow::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.values.get(&key) {
            Some(existing) if *existing == value => {}
            _ => {
                self.dirty.insert(key.clone());
                self.values.insert(key, value);
            }
        }
    }

    pub fn update(&mut self, entries: impl IntoIterator<Item = (String, Value)>) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// The dirty subset of the values, for a partial write.
    pub fn dirty_values(&self) -> ValueMap {
        self.dirty
            .iter()
            .filter_map(|key| {
                self.values
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    /// Replace every value with a fresh server row and mark the row clean.
    pub fn replace(&mut self, values: ValueMap) {
        self.values = values;
        self.dirty.clear();
    }
}

/// Decimal amount paired with the currency code it is denominated in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// One row of one entity type, with dirty tracking and schema checks.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    row: TrackedRow,
}

impl Record {
    pub(crate) fn new(schema: Arc<Schema>, row: TrackedRow) -> Self {
        Record { schema, row }
    }

    pub fn entity_type(&self) -> &str {
        self.schema.entity_type()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Primary key, once the record has been saved or fetched.
    pub fn id(&self) -> Option<i64> {
        self.row.get("id").and_then(Value::as_i64)
    }

    pub fn is_saved(&self) -> bool {
        self.id().is_some()
    }

    /// Current value of a declared field, falling back to the declared
    /// default and then to null.
    pub fn get(&self, field: &str) -> Result<Value> {
        let def = self.field(field)?;
        match self.row.get(field) {
            Some(value) => Ok(value.clone()),
            None => Ok(def.default().cloned().unwrap_or(Value::Null)),
        }
    }

    /// Write a declared field. The value must match the field kind; lossless
    /// widenings (int into decimal or float, a reference into its relation
    /// id) are applied, anything else is rejected without touching the row.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let def = self.field(field)?;
        let value = coerce(def, value.into())?;
        self.row.set(field, value);
        Ok(())
    }

    /// Amount and currency of a money field, composed from the amount field
    /// and the currency field its spec names.
    pub fn money(&self, field: &str) -> Result<Option<Money>> {
        let def = self.field(field)?;
        let currency_field = match def.kind() {
            FieldKind::Money { currency_field } => currency_field,
            other => {
                return Err(Error::InvalidFieldValue {
                    field: field.to_string(),
                    expected: "money",
                    got: other.expected(),
                })
            }
        };
        let amount = match self.row.get(field) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Decimal(amount)) => *amount,
            Some(Value::Int(n)) => Decimal::from(*n),
            Some(other) => {
                return Err(Error::InvalidFieldValue {
                    field: field.to_string(),
                    expected: "decimal",
                    got: other.kind_name(),
                })
            }
        };
        let currency = self
            .row
            .get(currency_field)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidFieldValue {
                field: currency_field.clone(),
                expected: "string",
                got: "null",
            })?;
        Ok(Some(Money {
            amount,
            currency: currency.to_string(),
        }))
    }

    /// Keys written since the last sync, with their values.
    pub fn changes(&self) -> ValueMap {
        self.row.dirty_values()
    }

    pub fn is_dirty(&self) -> bool {
        self.row.is_dirty()
    }

    pub fn values(&self) -> &ValueMap {
        self.row.values()
    }

    /// Follow a belongs-to field to its target record. Resolves through the
    /// registry cache when the field spec opted in.
    pub fn related(&self, registry: &Registry<'_>, field: &str) -> Result<Option<Record>> {
        let def = self.field(field)?;
        let (entity, cached) = match def.kind() {
            FieldKind::BelongsTo { entity, cached } => (entity.clone(), *cached),
            other => {
                return Err(Error::InvalidFieldValue {
                    field: field.to_string(),
                    expected: "belongs_to",
                    got: other.expected(),
                })
            }
        };
        let id = match self.row.get(field) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Int(id)) => *id,
            Some(Value::Reference(r)) => r.id,
            Some(other) => {
                return Err(Error::InvalidFieldValue {
                    field: field.to_string(),
                    expected: "relation id",
                    got: other.kind_name(),
                })
            }
        };
        let record = if cached {
            registry.from_cache(&entity, id)?
        } else {
            registry.get_by_id(&entity, id)?
        };
        Ok(Some(record))
    }

    /// Follow a has-many field to its target records, in stored id order.
    pub fn related_many(&self, registry: &Registry<'_>, field: &str) -> Result<Vec<Record>> {
        let def = self.field(field)?;
        let entity = match def.kind() {
            FieldKind::HasMany { entity } => entity.clone(),
            other => {
                return Err(Error::InvalidFieldValue {
                    field: field.to_string(),
                    expected: "has_many",
                    got: other.expected(),
                })
            }
        };
        let ids = match self.row.get(field) {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(value) => relation_ids(field, value)?,
        };
        registry.records_from_ids(&entity, &ids)
    }

    /// Push local changes to the server and re-read the row.
    ///
    /// A saved record writes only its dirty fields (no write at all when
    /// clean); an unsaved one is created and adopts the returned id. Either
    /// way the row is refreshed afterwards and written through to the cache.
    pub fn save(&mut self, registry: &Registry<'_>) -> Result<()> {
        let model = registry.model_for(&self.schema);
        match self.id() {
            Some(id) => {
                let changes = self.row.dirty_values();
                if !changes.is_empty() {
                    model.write(&[id], &changes, None)?;
                }
            }
            None => {
                let ids = model.create(&[self.row.values().clone()], None)?;
                let id = ids.first().copied().ok_or_else(|| {
                    malformed_response("create returned no id".to_string())
                })?;
                self.row.set("id", Value::Int(id));
            }
        }
        self.refresh(registry)?;
        registry.store_in_cache(self)?;
        Ok(())
    }

    /// Drop local state and re-read every declared field. The cache entry is
    /// invalidated first so a concurrent reader cannot resurrect the stale
    /// row.
    pub fn refresh(&mut self, registry: &Registry<'_>) -> Result<()> {
        let id = self.id().ok_or(Error::UnsavedRecord("refresh"))?;
        registry.invalidate(self.entity_type(), id)?;
        let fields = self.schema.field_names();
        let model = registry.model_for(&self.schema);
        let rows = model.read(&[id], Some(&fields), None)?;
        let row = rows.into_iter().next().ok_or(Error::NoResultFound)?;
        self.row.replace(row);
        Ok(())
    }

    /// Delete the server row, invalidating the cache entry first.
    pub fn delete(self, registry: &Registry<'_>) -> Result<()> {
        let id = self.id().ok_or(Error::UnsavedRecord("delete"))?;
        registry.invalidate(self.entity_type(), id)?;
        registry.model_for(&self.schema).delete(&[id], None)
    }

    fn field(&self, name: &str) -> Result<&FieldDef> {
        self.schema.field(name).ok_or_else(|| Error::UnknownField {
            entity: self.entity_type().to_string(),
            field: name.to_string(),
        })
    }
}

/// Saved records compare by entity type and id; unsaved ones by entity type
/// and values. A saved record never equals an unsaved one.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        if self.entity_type() != other.entity_type() {
            return false;
        }
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.row.values() == other.row.values(),
            _ => false,
        }
    }
}

fn coerce(def: &FieldDef, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = |got: &'static str| Error::InvalidFieldValue {
        field: def.name().to_string(),
        expected: def.kind().expected(),
        got,
    };
    match (def.kind(), value) {
        (FieldKind::Int, v @ Value::Int(_)) => Ok(v),
        (FieldKind::Bool, v @ Value::Bool(_)) => Ok(v),
        (FieldKind::String, v @ Value::String(_)) => Ok(v),
        (FieldKind::Float, v @ Value::Float(_)) => Ok(v),
        (FieldKind::Float, Value::Int(n)) => Ok(Value::Float(n as f64)),
        (FieldKind::Decimal | FieldKind::Money { .. }, v @ Value::Decimal(_)) => Ok(v),
        (FieldKind::Decimal | FieldKind::Money { .. }, Value::Int(n)) => {
            Ok(Value::Decimal(Decimal::from(n)))
        }
        (FieldKind::Date, v @ Value::Date(_)) => Ok(v),
        (FieldKind::DateTime, v @ Value::DateTime(_)) => Ok(v),
        (FieldKind::BelongsTo { .. }, v @ Value::Int(_)) => Ok(v),
        (FieldKind::BelongsTo { .. }, Value::Reference(r)) => Ok(Value::Int(r.id)),
        (FieldKind::HasMany { .. }, v @ Value::List(_)) => {
            relation_ids(def.name(), &v)?;
            Ok(v)
        }
        (_, other) => Err(mismatch(other.kind_name())),
    }
}

fn relation_ids(field: &str, value: &Value) -> Result<Vec<i64>> {
    let items = value.as_list().ok_or_else(|| Error::InvalidFieldValue {
        field: field.to_string(),
        expected: "id list",
        got: value.kind_name(),
    })?;
    items
        .iter()
        .map(|item| {
            item.as_i64().ok_or_else(|| Error::InvalidFieldValue {
                field: field.to_string(),
                expected: "id list",
                got: item.kind_name(),
            })
        })
        .collect()
}

/// Schema registry bound to one session, with an optional record cache.
pub struct Registry<'a> {
    session: &'a Session,
    cache: Option<Box<dyn CacheBackend>>,
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl<'a> Registry<'a> {
    pub fn new(session: &'a Session) -> Self {
        Registry {
            session,
            cache: None,
            schemas: BTreeMap::new(),
        }
    }

    pub fn with_cache(mut self, cache: Box<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session(&self) -> &'a Session {
        self.session
    }

    /// Register an entity type. Each name can be registered once.
    pub fn register(&mut self, schema: Schema) -> Result<Arc<Schema>> {
        let entity = schema.entity_type().to_string();
        if self.schemas.contains_key(&entity) {
            return Err(Error::DuplicateEntityType(entity));
        }
        let schema = Arc::new(schema);
        self.schemas.insert(entity, schema.clone());
        Ok(schema)
    }

    pub fn schema(&self, entity: &str) -> Result<Arc<Schema>> {
        self.schemas
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::UnknownEntityType(entity.to_string()))
    }

    /// Fresh unsaved record of a registered entity type.
    pub fn new_record(&self, entity: &str) -> Result<Record> {
        Ok(Record::new(self.schema(entity)?, TrackedRow::empty()))
    }

    /// Wrap a row already fetched by other means, for example a query over
    /// the plain RPC surface.
    pub fn record_from_row(&self, entity: &str, row: Row) -> Result<Record> {
        Ok(Record::new(self.schema(entity)?, TrackedRow::new(row)))
    }

    /// Read one record's eager fields from the server, bypassing the cache.
    pub fn get_by_id(&self, entity: &str, id: i64) -> Result<Record> {
        let schema = self.schema(entity)?;
        let fields = schema.eager_field_names();
        let rows = self.model_for(&schema).read(&[id], Some(&fields), None)?;
        let row = rows.into_iter().next().ok_or(Error::NoResultFound)?;
        Ok(Record::new(schema, TrackedRow::new(row)))
    }

    /// Bulk eager read, keeping the requested id order. Ids the server does
    /// not return are silently dropped.
    pub fn records_from_ids(&self, entity: &str, ids: &[i64]) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.schema(entity)?;
        let fields = schema.eager_field_names();
        let rows = self.model_for(&schema).read(ids, Some(&fields), None)?;
        let mut by_id: BTreeMap<i64, Row> = BTreeMap::new();
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_i64) {
                by_id.insert(id, row);
            }
        }
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = by_id.remove(id) {
                records.push(Record::new(schema.clone(), TrackedRow::new(row)));
            }
        }
        Ok(records)
    }

    /// Read-through single fetch. A hit deserializes the cached row; a miss
    /// reads the eager fields remotely and stores them. Without a backend
    /// this is a plain remote read.
    pub fn from_cache(&self, entity: &str, id: i64) -> Result<Record> {
        let schema = self.schema(entity)?;
        let Some(cache) = &self.cache else {
            return self.get_by_id(entity, id);
        };
        let key = self.cache_key(entity, id);
        if let Some(text) = cache.get(&key)? {
            let row = self.decode_cached(&text)?;
            return Ok(Record::new(schema, TrackedRow::new(row)));
        }
        let record = self.get_by_id(entity, id)?;
        cache.set(&key, encode_record(&record), None)?;
        Ok(record)
    }

    /// Bulk read-through fetch, keeping the requested id order.
    ///
    /// A failing cache lookup (or an undecodable entry) degrades into a
    /// logged miss and the rows are read remotely instead; only the remote
    /// read itself can fail the call. With `ignore_misses` the ids the
    /// server no longer knows are dropped, otherwise any gap is an error.
    pub fn from_cache_multi(
        &self,
        entity: &str,
        ids: &[i64],
        ignore_misses: bool,
    ) -> Result<Vec<Record>> {
        let schema = self.schema(entity)?;
        let mut found: BTreeMap<i64, Record> = BTreeMap::new();
        let mut missing: Vec<i64> = Vec::new();
        match &self.cache {
            Some(cache) => {
                let keys: Vec<String> =
                    ids.iter().map(|id| self.cache_key(entity, *id)).collect();
                match cache.mget(&keys) {
                    Ok(entries) => {
                        for (&id, entry) in ids.iter().zip(entries) {
                            let row = entry.as_deref().and_then(|text| {
                                self.decode_cached(text)
                                    .map_err(|err| {
                                        warn!(entity, id, error = %err, "dropping undecodable cache entry");
                                        err
                                    })
                                    .ok()
                            });
                            match row {
                                Some(row) => {
                                    found.insert(
                                        id,
                                        Record::new(schema.clone(), TrackedRow::new(row)),
                                    );
                                }
                                None => missing.push(id),
                            }
                        }
                    }
                    Err(err) => {
                        warn!(entity, error = %err, "cache lookup failed, reading remotely");
                        missing = ids.to_vec();
                    }
                }
            }
            None => missing = ids.to_vec(),
        }
        if !missing.is_empty() {
            for record in self.records_from_ids(entity, &missing)? {
                if let Err(err) = self.store_in_cache(&record) {
                    warn!(entity, error = %err, "cache store failed");
                }
                if let Some(id) = record.id() {
                    found.insert(id, record);
                }
            }
        }
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match found.remove(id) {
                Some(record) => records.push(record),
                None if ignore_misses => {}
                None => return Err(Error::NoResultFound),
            }
        }
        Ok(records)
    }

    /// Fluent query producing [`Record`]s instead of raw rows.
    pub fn query(&self, entity: &str) -> Result<RecordQuery<'_>> {
        let schema = self.schema(entity)?;
        let model = self.model_for(&schema);
        let inner = Query::new(model).with_fields(schema.field_names());
        Ok(RecordQuery {
            registry: self,
            schema,
            inner,
        })
    }

    pub(crate) fn model_for(&self, schema: &Schema) -> Model<'a> {
        self.session.model(schema.entity_type())
    }

    pub(crate) fn store_in_cache(&self, record: &Record) -> Result<()> {
        let (Some(cache), Some(id)) = (&self.cache, record.id()) else {
            return Ok(());
        };
        let key = self.cache_key(record.entity_type(), id);
        cache.set(&key, encode_record(record), None)?;
        Ok(())
    }

    pub(crate) fn invalidate(&self, entity: &str, id: i64) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.delete(&self.cache_key(entity, id))?;
        }
        Ok(())
    }

    fn cache_key(&self, entity: &str, id: i64) -> String {
        format!("{}:{}:{}", self.session.account(), entity, id)
    }

    fn decode_cached(&self, text: &str) -> Result<Row> {
        match self.session.codec().decode_str(text)? {
            Value::Map(row) => Ok(row),
            other => Err(malformed_response(format!(
                "cached row is {}, not a map",
                other.kind_name()
            ))),
        }
    }
}

impl fmt::Debug for Registry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("account", &self.session.account())
            .field("entities", &self.schemas.keys().collect::<Vec<_>>())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

fn encode_record(record: &Record) -> String {
    encode_to_string(&Value::Map(record.values().clone()))
}

/// [`Query`] wrapper whose terminals return records. Refinements behave
/// exactly like the underlying builder: copy-on-write, archived-record
/// filtering via `active_test`.
#[derive(Debug)]
pub struct RecordQuery<'a> {
    registry: &'a Registry<'a>,
    schema: Arc<Schema>,
    inner: Query<'a>,
}

impl<'a> RecordQuery<'a> {
    fn refined(&self, inner: Query<'a>) -> Self {
        RecordQuery {
            registry: self.registry,
            schema: self.schema.clone(),
            inner,
        }
    }

    pub fn filter_by(&self, field: &str, value: impl Into<Value>) -> Self {
        self.refined(self.inner.filter_by(field, value))
    }

    pub fn filter_by_domain(&self, domain: Domain) -> Self {
        self.refined(self.inner.filter_by_domain(domain))
    }

    pub fn order_by(&self, order: impl Into<Order>) -> Self {
        self.refined(self.inner.order_by(order))
    }

    pub fn limit(&self, limit: u64) -> Self {
        self.refined(self.inner.limit(limit))
    }

    pub fn offset(&self, offset: u64) -> Self {
        self.refined(self.inner.offset(offset))
    }

    pub fn show_active_only(&self, flag: bool) -> Self {
        self.refined(self.inner.show_active_only(flag))
    }

    pub fn all(&self) -> impl Iterator<Item = Result<Record>> + 'a {
        let schema = self.schema.clone();
        self.inner
            .all()
            .map(move |row| row.map(|row| Record::new(schema.clone(), TrackedRow::new(row))))
    }

    pub fn first(&self) -> Result<Option<Record>> {
        Ok(self.inner.first()?.map(|row| self.wrap(row)))
    }

    pub fn get(&self, id: i64) -> Result<Option<Record>> {
        Ok(self.inner.get(id)?.map(|row| self.wrap(row)))
    }

    pub fn one(&self) -> Result<Record> {
        Ok(self.wrap(self.inner.one()?))
    }

    pub fn count(&self) -> Result<u64> {
        self.inner.count()
    }

    pub fn exists(&self) -> Result<bool> {
        self.inner.exists()
    }

    pub fn delete(&self) -> Result<()> {
        self.inner.delete()
    }

    pub fn archive(&self) -> Result<()> {
        self.inner.archive()
    }

    fn wrap(&self, row: Row) -> Record {
        Record::new(self.schema.clone(), TrackedRow::new(row))
    }
}
