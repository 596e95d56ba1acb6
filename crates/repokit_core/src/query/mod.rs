//! Query construction, derivation and evaluation.
//!
//! # Responsibility
//! - Normalize method names and explicit descriptors into one
//!   `QueryDescriptor` shape.
//! - Compose specifications, build example predicates, sort and paginate.
//!
//! # Invariants
//! - Every property path is checked against the entity schema before a scan.
//! - Mixed `And`/`Or` method names are rejected; grouping must be explicit.

use crate::model::entity::{Entity, EntityKind};
use crate::model::value::AttrKind;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod condition;
pub mod derive;
pub mod descriptor;
pub mod example;
pub mod page;
pub mod specification;

pub use condition::{Condition, Operator, QueryArg, TextPattern};
pub use derive::{derive_query, Criterion, QueryTemplate};
pub use descriptor::{Connector, Direction, QueryAction, QueryDescriptor, SortOrder};
pub use example::{Example, ExampleMatcher, ExampleValue, StringMatcher};
pub use page::{Page, PageRequest};
pub use specification::{Clause, RelationResolver, Specification};

pub type QueryResult<T> = Result<T, QueryError>;

/// Query-layer error raised before any entity is scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Property path does not exist on the entity schema.
    SchemaMismatch { entity: EntityKind, path: String },
    InvalidMethodName { method: String, reason: String },
    /// Method name mixes `And` and `Or`.
    MixedConnectors { method: String },
    ArgumentCount { expected: usize, actual: usize },
    TypeMismatch {
        path: String,
        expected: AttrKind,
        actual: AttrKind,
    },
    InvalidPattern { pattern: String, message: String },
    InvalidPageRequest(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaMismatch { entity, path } => {
                write!(f, "unknown property `{path}` on {entity}")
            }
            Self::InvalidMethodName { method, reason } => {
                write!(f, "invalid query method `{method}`: {reason}")
            }
            Self::MixedConnectors { method } => write!(
                f,
                "query method `{method}` mixes And/Or; use an explicit specification for grouping"
            ),
            Self::ArgumentCount { expected, actual } => {
                write!(f, "query expects {expected} argument(s), got {actual}")
            }
            Self::TypeMismatch {
                path,
                expected,
                actual,
            } => write!(f, "property `{path}` expects {expected}, got {actual}"),
            Self::InvalidPattern { pattern, message } => {
                write!(f, "invalid match pattern `{pattern}`: {message}")
            }
            Self::InvalidPageRequest(message) => write!(f, "invalid page request: {message}"),
        }
    }
}

impl Error for QueryError {}

/// Dotted path to an attribute, a related attribute, or a bare relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyPath {
    Attribute(String),
    Related { relation: String, attribute: String },
    /// The relation itself, compared by referenced identity.
    Reference(String),
}

impl PropertyPath {
    /// Parses `name` or `relation.attribute`.
    pub fn parse(path: &str) -> Self {
        match path.split_once('.') {
            Some((relation, attribute)) => Self::Related {
                relation: relation.to_string(),
                attribute: attribute.to_string(),
            },
            None => Self::Attribute(path.to_string()),
        }
    }

    /// Returns the declared kind of this path on `E`.
    pub fn resolve_kind<E: Entity>(&self) -> QueryResult<AttrKind> {
        let found = match self {
            Self::Attribute(name) => E::attribute_def(name).map(|def| def.kind),
            Self::Related {
                relation,
                attribute,
            } => E::relation_def(relation)
                .and_then(|def| def.attribute(attribute))
                .map(|def| def.kind),
            Self::Reference(relation) => E::relation_def(relation).map(|_| AttrKind::Int),
        };
        found.ok_or_else(|| QueryError::SchemaMismatch {
            entity: E::KIND,
            path: self.to_string(),
        })
    }
}

impl Display for PropertyPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attribute(name) | Self::Reference(name) => f.write_str(name),
            Self::Related {
                relation,
                attribute,
            } => write!(f, "{relation}.{attribute}"),
        }
    }
}

impl From<&str> for PropertyPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}
