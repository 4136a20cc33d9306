//! Synchronous client core for the Stockline business API.
//!
//! # Overview
//! A [`Session`] addresses one hosted account and signs every request; model
//! proxies speak the generic RPC surface (`search`, `read`, `write`, method
//! calls); a fluent [`Query`] builder and the schema-aware record layer sit
//! on top. Values cross the wire through a typed JSON codec that round-trips
//! dates, decimals, byte strings and record references.
//!
//! # Design
//! - Requests and responses are plain data (`HttpRequest` / `HttpResponse`);
//!   the wire is reached only through the [`Transport`] trait, so tests
//!   script exchanges without a socket.
//! - Remote failures are classified into the [`Error`] taxonomy from status
//!   and body; local misuse gets its own variants.
//! - Records are owned data: lifecycle calls take the [`Registry`]
//!   explicitly instead of hiding a session inside every row.

pub mod auth;
pub mod cache;
pub mod codec;
pub mod error;
pub mod http;
pub mod model;
pub mod query;
pub mod record;
pub mod report;
pub mod schema;
pub mod session;
pub mod task;
pub mod wizard;

pub use auth::{ApiVersion, Auth};
pub use cache::{CacheBackend, MemoryCache};
pub use codec::{Codec, Reference, Value, ValueMap};
pub use error::{CacheError, CodecError, Error, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse, Transport, UreqTransport};
pub use model::{asc, desc, Domain, FindOptions, Model, Order, Row, SearchReadAll, StreamOptions};
pub use query::Query;
pub use record::{Money, Record, RecordQuery, Registry, TrackedRow};
pub use report::Report;
pub use schema::{FieldDef, FieldKind, Schema, SchemaBuilder};
pub use session::{Context, Session};
pub use task::{TaskHandle, TaskRef, TaskState};
pub use wizard::{Wizard, WizardData, WizardSession, WizardStep};
