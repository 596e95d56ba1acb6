//! Read-only reduced views over entities.
//!
//! # Responsibility
//! - Map an entity onto a named field subset, with nested views of related
//!   entities.
//! - Load nested views eagerly or on first dereference per `LoadPolicy`.
//!
//! # Invariants
//! - A projection holds exactly the requested fields that carry a value.
//! - Shapes are validated before any field is read.
//! - A deferred nested view is fetched at most once.

use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::model::value::{AttrValue, AttributeMap};
use crate::query::specification::RelationResolver;
use crate::repo::{RepoError, RepoResult};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Explicit related-entity loading strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Resolve nested views while projecting.
    #[default]
    EagerJoin,
    /// Keep the related id and fetch on first `related()` call.
    DeferredFetchById,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    UnknownField { entity: EntityKind, field: String },
}

impl Display for ProjectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField { entity, field } => {
                write!(f, "projection field `{field}` does not exist on {entity}")
            }
        }
    }
}

impl Error for ProjectionError {}

/// Requested field subset, optionally with nested shapes per relation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewShape {
    fields: Vec<String>,
    nested: BTreeMap<String, ViewShape>,
}

impl ViewShape {
    pub fn of<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            nested: BTreeMap::new(),
        }
    }

    pub fn with_nested(mut self, relation: impl Into<String>, shape: ViewShape) -> Self {
        self.nested.insert(relation.into(), shape);
        self
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Checks every field and nested relation against `E`'s schema.
    pub fn validate<E: Entity>(&self) -> Result<(), ProjectionError> {
        let unknown = |field: String| ProjectionError::UnknownField {
            entity: E::KIND,
            field,
        };

        for field in &self.fields {
            if E::attribute_def(field).is_none() {
                return Err(unknown(field.clone()));
            }
        }
        for (relation, shape) in &self.nested {
            let def = E::relation_def(relation).ok_or_else(|| unknown(relation.clone()))?;
            for field in &shape.fields {
                if def.attribute(field).is_none() {
                    return Err(unknown(format!("{relation}.{field}")));
                }
            }
            if let Some(inner) = shape.nested.keys().next() {
                return Err(unknown(format!("{relation}.{inner}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum NestedView {
    Absent,
    Loaded(Box<Projection>),
    Deferred {
        target: EntityKind,
        id: EntityId,
        shape: ViewShape,
        cell: OnceCell<Box<Projection>>,
    },
}

/// Read-only reduced view of one entity.
#[derive(Debug, Clone)]
pub struct Projection {
    kind: EntityKind,
    fields: BTreeMap<String, AttrValue>,
    nested: BTreeMap<String, NestedView>,
}

impl Projection {
    /// Projects `entity` onto `shape`.
    ///
    /// # Errors
    /// - `UnknownField` when the shape names a field `E` does not have.
    /// - `JoinTargetMissing` when an eager nested view hits a dangling
    ///   reference.
    pub fn project<E: Entity>(
        entity: &E,
        shape: &ViewShape,
        policy: LoadPolicy,
        resolver: &dyn RelationResolver,
    ) -> RepoResult<Self> {
        shape.validate::<E>()?;

        let fields = pick(&entity.attributes(), &shape.fields);
        let mut nested = BTreeMap::new();
        for (relation, nested_shape) in &shape.nested {
            let view = match (E::relation_def(relation), entity.reference(relation)) {
                (Some(def), Some(id)) => match policy {
                    LoadPolicy::EagerJoin => NestedView::Loaded(Box::new(load(
                        resolver,
                        relation,
                        def.target,
                        id,
                        nested_shape,
                    )?)),
                    LoadPolicy::DeferredFetchById => NestedView::Deferred {
                        target: def.target,
                        id,
                        shape: nested_shape.clone(),
                        cell: OnceCell::new(),
                    },
                },
                _ => NestedView::Absent,
            };
            nested.insert(relation.clone(), view);
        }

        Ok(Self {
            kind: E::KIND,
            fields,
            nested,
        })
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn get(&self, field: &str) -> Option<&AttrValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(AttrValue::as_text)
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(AttrValue::as_int)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Whether the nested view for `relation` needs no further fetch.
    pub fn is_loaded(&self, relation: &str) -> bool {
        match self.nested.get(relation) {
            Some(NestedView::Deferred { cell, .. }) => cell.get().is_some(),
            _ => true,
        }
    }

    /// Dereferences the nested view for `relation`, fetching it if deferred.
    ///
    /// Returns `Ok(None)` when the entity has no related entity.
    pub fn related(
        &self,
        relation: &str,
        resolver: &dyn RelationResolver,
    ) -> RepoResult<Option<&Projection>> {
        match self.nested.get(relation) {
            None => Err(ProjectionError::UnknownField {
                entity: self.kind,
                field: relation.to_string(),
            }
            .into()),
            Some(NestedView::Absent) => Ok(None),
            Some(NestedView::Loaded(projection)) => Ok(Some(&**projection)),
            Some(NestedView::Deferred {
                target,
                id,
                shape,
                cell,
            }) => {
                let projection = cell.get_or_try_init(|| {
                    load(resolver, relation, *target, *id, shape).map(Box::new)
                })?;
                Ok(Some(&**projection))
            }
        }
    }
}

fn pick(attributes: &AttributeMap, fields: &[String]) -> BTreeMap<String, AttrValue> {
    fields
        .iter()
        .filter_map(|field| {
            attributes
                .get(field)
                .map(|value| (field.clone(), value.clone()))
        })
        .collect()
}

fn load(
    resolver: &dyn RelationResolver,
    relation: &str,
    target: EntityKind,
    id: EntityId,
    shape: &ViewShape,
) -> RepoResult<Projection> {
    let attributes = resolver
        .resolve(target, id)
        .ok_or_else(|| RepoError::JoinTargetMissing {
            relation: relation.to_string(),
            id: Some(id),
        })?;
    Ok(Projection {
        kind: target,
        fields: pick(&attributes, &shape.fields),
        nested: BTreeMap::new(),
    })
}
