//! Static field declarations for the record layer.
//!
//! # Design
//! A schema is a plain list of named, typed field specs, assembled by a
//! builder and validated once at build time. No reflection: what a record
//! type knows about itself is exactly what was declared. `extend` reuses a
//! parent schema's fields for server-side entity types that share a base.

use crate::codec::Value;
use crate::error::{Error, Result};

/// Kind of a declared field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Int,
    Bool,
    String,
    Float,
    Decimal,
    Date,
    DateTime,
    /// Decimal amount paired with a currency code read from another field.
    Money { currency_field: String },
    /// Single related record, stored as its id.
    BelongsTo { entity: String, cached: bool },
    /// Related record list, stored as an id list.
    HasMany { entity: String },
}

impl FieldKind {
    /// Short name for error messages.
    pub fn expected(&self) -> &'static str {
        match self {
            FieldKind::Int => "int",
            FieldKind::Bool => "bool",
            FieldKind::String => "string",
            FieldKind::Float => "float",
            FieldKind::Decimal => "decimal",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::Money { .. } => "money",
            FieldKind::BelongsTo { .. } => "belongs_to",
            FieldKind::HasMany { .. } => "has_many",
        }
    }
}

/// One declared field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    name: String,
    kind: FieldKind,
    required: bool,
    default: Option<Value>,
    eager: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldDef {
            name: name.into(),
            kind,
            required: false,
            default: None,
            eager: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Exclude this field from bulk reads; it is fetched on refresh only.
    pub fn lazy(mut self) -> Self {
        self.eager = false;
        self
    }

    /// Resolve this relation through the registry cache. Only meaningful on
    /// belongs-to fields.
    pub fn cached(mut self) -> Self {
        if let FieldKind::BelongsTo { cached, .. } = &mut self.kind {
            *cached = true;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

pub fn int(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::Int)
}

pub fn boolean(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::Bool)
}

pub fn string(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::String)
}

pub fn float(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::Float)
}

pub fn decimal(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::Decimal)
}

pub fn date(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::Date)
}

pub fn datetime(name: impl Into<String>) -> FieldDef {
    FieldDef::new(name, FieldKind::DateTime)
}

pub fn money(name: impl Into<String>, currency_field: impl Into<String>) -> FieldDef {
    FieldDef::new(
        name,
        FieldKind::Money {
            currency_field: currency_field.into(),
        },
    )
}

pub fn belongs_to(name: impl Into<String>, entity: impl Into<String>) -> FieldDef {
    FieldDef::new(
        name,
        FieldKind::BelongsTo {
            entity: entity.into(),
            cached: false,
        },
    )
}

pub fn has_many(name: impl Into<String>, entity: impl Into<String>) -> FieldDef {
    FieldDef::new(
        name,
        FieldKind::HasMany {
            entity: entity.into(),
        },
    )
}

/// Field layout of one entity type. Built once, shared by every record.
#[derive(Debug)]
pub struct Schema {
    entity: String,
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn builder(entity: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            entity: Some(entity.into()),
            fields: Vec::new(),
        }
    }

    /// Start from a parent schema's entity type and fields; both can be
    /// overridden on the builder.
    pub fn extend(parent: &Schema) -> SchemaBuilder {
        SchemaBuilder {
            entity: Some(parent.entity.clone()),
            fields: parent.fields.clone(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Every declared field name, in declaration order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Names of the fields included in bulk reads.
    pub fn eager_field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.eager)
            .map(|f| f.name.clone())
            .collect()
    }
}

/// Assembles a [`Schema`]; `build` fails when the entity-type name is
/// missing so a bad definition surfaces where it is written.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entity: Option<String>,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    pub fn entity(mut self, name: impl Into<String>) -> Self {
        self.entity = Some(name.into());
        self
    }

    /// Declare a field; re-declaring a name replaces the inherited or
    /// earlier spec.
    pub fn field(mut self, def: FieldDef) -> Self {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == def.name) {
            *existing = def;
        } else {
            self.fields.push(def);
        }
        self
    }

    pub fn build(self) -> Result<Schema> {
        let entity = match self.entity {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(Error::SchemaDefinition(
                    "entity type name is missing".to_string(),
                ))
            }
        };
        let mut fields = self.fields;
        if !fields.iter().any(|f| f.name == "id") {
            fields.insert(0, int("id"));
        }
        Ok(Schema { entity, fields })
    }
}
