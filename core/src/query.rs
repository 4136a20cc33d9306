//! Fluent, copy-on-write query builder.
//!
//! # Design
//! Refinements never mutate: each one clones the builder (domain and order
//! lists included) and returns the refined clone, so a partially built query
//! can fan out safely. The archived-record flag is not part of the domain;
//! it travels as the `active_test` context key, recomputed fresh for every
//! terminal call.

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::model::{Domain, Model, Order, Row, SearchReadAll, StreamOptions};
use crate::session::Context;

/// Rows fetched per stride when a query is streamed.
const DEFAULT_BATCH_SIZE: u64 = 500;

#[derive(Debug, Clone)]
pub struct Query<'a> {
    model: Model<'a>,
    domain: Domain,
    order: Option<Order>,
    limit: Option<u64>,
    offset: Option<u64>,
    active_only: bool,
    fields: Option<Vec<String>>,
}

impl<'a> Model<'a> {
    /// Fluent query over this entity type.
    pub fn query(&self) -> Query<'a> {
        Query::new(self.clone())
    }
}

impl<'a> Query<'a> {
    pub fn new(model: Model<'a>) -> Self {
        Query {
            model,
            domain: Domain::all(),
            order: None,
            limit: None,
            offset: None,
            active_only: true,
            fields: None,
        }
    }

    fn refined(&self, apply: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        apply(&mut next);
        next
    }

    /// Append an equality clause.
    pub fn filter_by(&self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.refined(|q| q.domain = q.domain.clone().and_eq(field, value))
    }

    /// Replace the domain wholesale.
    pub fn filter_by_domain(&self, domain: Domain) -> Self {
        self.refined(|q| q.domain = domain)
    }

    /// Replace the ordering criteria.
    pub fn order_by(&self, order: impl Into<Order>) -> Self {
        let order = order.into();
        self.refined(|q| q.order = Some(order))
    }

    pub fn limit(&self, limit: u64) -> Self {
        self.refined(|q| q.limit = Some(limit))
    }

    pub fn offset(&self, offset: u64) -> Self {
        self.refined(|q| q.offset = Some(offset))
    }

    /// Toggle archived-record filtering (on by default).
    pub fn show_active_only(&self, flag: bool) -> Self {
        self.refined(|q| q.active_only = flag)
    }

    /// Restrict the columns terminals read.
    pub(crate) fn with_fields(&self, fields: Vec<String>) -> Self {
        self.refined(|q| q.fields = Some(fields))
    }

    /// Archived-record visibility, as the per-call context.
    fn context(&self) -> Context {
        let mut ctx = Context::new();
        ctx.insert("active_test".to_string(), Value::Bool(self.active_only));
        ctx
    }

    /// Stream every matching row lazily.
    pub fn all(&self) -> SearchReadAll<'a> {
        self.model.search_read_all(
            self.domain.clone(),
            self.order.clone(),
            self.fields.clone(),
            StreamOptions {
                batch_size: DEFAULT_BATCH_SIZE,
                offset: self.offset.unwrap_or(0),
                limit: self.limit,
            },
            Some(&self.context()),
        )
    }

    /// First matching row, if any.
    pub fn first(&self) -> Result<Option<Row>> {
        let rows = self.model.search_read(
            &self.domain,
            self.offset,
            Some(1),
            self.order.as_ref(),
            self.fields.as_deref(),
            Some(&self.context()),
        )?;
        Ok(rows.into_iter().next())
    }

    /// Point lookup by primary key. Archived records are reachable: the
    /// `active_test` filter is forced off for this call only.
    pub fn get(&self, id: i64) -> Result<Option<Row>> {
        let mut ctx = Context::new();
        ctx.insert("active_test".to_string(), Value::Bool(false));
        let rows = self.model.search_read(
            &Domain::eq("id", id),
            None,
            Some(1),
            None,
            self.fields.as_deref(),
            Some(&ctx),
        )?;
        Ok(rows.into_iter().next())
    }

    /// Exactly one matching row. Fetches at most two to tell "none" from
    /// "more than one".
    pub fn one(&self) -> Result<Row> {
        let mut rows = self.model.search_read(
            &self.domain,
            self.offset,
            Some(2),
            self.order.as_ref(),
            self.fields.as_deref(),
            Some(&self.context()),
        )?;
        match rows.len() {
            0 => Err(Error::NoResultFound),
            1 => Ok(rows.remove(0)),
            _ => Err(Error::MultipleResultsFound),
        }
    }

    pub fn count(&self) -> Result<u64> {
        self.model.search_count(&self.domain, Some(&self.context()))
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    /// Delete every matching record.
    pub fn delete(&self) -> Result<()> {
        let ids = self
            .model
            .search(&self.domain, None, None, None, Some(&self.context()))?;
        if ids.is_empty() {
            return Ok(());
        }
        self.model.delete(&ids, Some(&self.context()))
    }

    /// Archive every matching record (`active = false`).
    pub fn archive(&self) -> Result<()> {
        let ids = self
            .model
            .search(&self.domain, None, None, None, Some(&self.context()))?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut values = crate::codec::ValueMap::new();
        values.insert("active".to_string(), Value::Bool(false));
        self.model.write(&ids, &values, Some(&self.context()))?;
        Ok(())
    }
}
