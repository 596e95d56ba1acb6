//! Entity schema contract implemented by every stored record type.
//!
//! # Responsibility
//! - Expose identity, version, attributes and relation references in a
//!   uniform, name-addressed way for the query layer.
//! - Carry a static schema so property paths are checked before execution.
//!
//! # Invariants
//! - `ATTRIBUTES` lists every name `attribute()` can answer.
//! - `reference()` returns `None` for an absent reference, never a stale id.

use crate::model::member::Member;
use crate::model::team::Team;
use crate::model::value::{AttrKind, AttrValue, AttributeMap};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

/// Store-assigned surrogate key.
pub type EntityId = u64;

/// Discriminates the entity tables held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Member,
    Team,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Team => "team",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named, typed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDef {
    pub name: &'static str,
    pub kind: AttrKind,
}

/// A zero-or-one reference to another entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationDef {
    pub name: &'static str,
    pub target: EntityKind,
    /// Attribute schema of the target kind, used for join validation.
    pub attributes: &'static [AttributeDef],
}

impl RelationDef {
    pub fn attribute(&self, name: &str) -> Option<&'static AttributeDef> {
        self.attributes.iter().find(|def| def.name == name)
    }
}

/// Field-level rule broken by an entity about to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    BlankField {
        kind: EntityKind,
        field: &'static str,
    },
    NegativeValue {
        kind: EntityKind,
        field: &'static str,
        value: i64,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankField { kind, field } => write!(f, "{kind}.{field} must not be blank"),
            Self::NegativeValue { kind, field, value } => {
                write!(f, "{kind}.{field} must not be negative, got {value}")
            }
        }
    }
}

impl Error for ValidationError {}

/// Converts an identity into the integer form queries compare against.
///
/// Identities beyond `i64::MAX` have no attribute value.
pub(crate) fn id_value(id: EntityId) -> Option<AttrValue> {
    i64::try_from(id).ok().map(AttrValue::Int)
}

/// Type-erased entity image used by journals and persistence adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Member(Member),
    Team(Team),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Member(_) => EntityKind::Member,
            Self::Team(_) => EntityKind::Team,
        }
    }

    pub fn id(&self) -> Option<EntityId> {
        match self {
            Self::Member(member) => member.id,
            Self::Team(team) => team.id,
        }
    }
}

/// Uniform, name-addressed view over a stored record type.
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    const KIND: EntityKind;
    const ATTRIBUTES: &'static [AttributeDef];
    const RELATIONS: &'static [RelationDef];

    fn id(&self) -> Option<EntityId>;
    fn assign_id(&mut self, id: EntityId);
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn attribute(&self, name: &str) -> Option<AttrValue>;
    fn reference(&self, relation: &str) -> Option<EntityId>;
    fn into_record(self) -> Record;
    fn from_record(record: Record) -> Option<Self>;

    /// Checks field rules; runs before every insert, merge and bulk update.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    fn attribute_def(name: &str) -> Option<&'static AttributeDef> {
        Self::ATTRIBUTES.iter().find(|def| def.name == name)
    }

    fn relation_def(name: &str) -> Option<&'static RelationDef> {
        Self::RELATIONS.iter().find(|def| def.name == name)
    }

    /// Snapshot of every attribute that currently has a value.
    fn attributes(&self) -> AttributeMap {
        Self::ATTRIBUTES
            .iter()
            .filter_map(|def| {
                self.attribute(def.name)
                    .map(|value| (def.name.to_string(), value))
            })
            .collect()
    }
}
