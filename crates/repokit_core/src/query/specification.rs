//! Composable boolean predicates over entity attributes and relations.
//!
//! # Responsibility
//! - Combine clauses with `and`/`or`/`not` to arbitrary depth.
//! - Traverse zero-or-one references to test related-entity attributes.
//!
//! # Invariants
//! - An absent reference never satisfies a related clause.
//! - A required join on an absent reference, or any join on a dangling
//!   reference, fails with `JoinTargetMissing` instead of silently matching.

use crate::model::entity::{id_value, Entity, EntityId, EntityKind};
use crate::model::value::AttributeMap;
use crate::query::condition::Condition;
use crate::query::{PropertyPath, QueryResult};
use crate::repo::{RepoError, RepoResult};
use std::fmt::{Display, Formatter};

/// Looks up related entities while a specification is evaluated.
pub trait RelationResolver {
    fn resolve(&self, kind: EntityKind, id: EntityId) -> Option<AttributeMap>;
}

/// One property path with its bound condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub path: PropertyPath,
    pub condition: Condition,
}

impl Clause {
    pub fn new(path: impl Into<PropertyPath>, condition: Condition) -> Self {
        Self {
            path: path.into(),
            condition,
        }
    }
}

impl Display for Clause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path, self.condition)
    }
}

/// Boolean predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Specification {
    /// Matches every entity.
    All,
    Where(Clause),
    /// Like `Where`, but an absent reference is an error instead of a miss.
    RequiredJoin(Clause),
    And(Box<Specification>, Box<Specification>),
    Or(Box<Specification>, Box<Specification>),
    Not(Box<Specification>),
}

impl Specification {
    pub fn attribute(name: &str, condition: Condition) -> Self {
        Self::Where(Clause::new(PropertyPath::Attribute(name.to_string()), condition))
    }

    /// Clause on an attribute of the entity referenced by `relation`.
    pub fn related(relation: &str, attribute: &str, condition: Condition) -> Self {
        Self::Where(Clause::new(
            PropertyPath::Related {
                relation: relation.to_string(),
                attribute: attribute.to_string(),
            },
            condition,
        ))
    }

    pub fn related_required(relation: &str, attribute: &str, condition: Condition) -> Self {
        Self::RequiredJoin(Clause::new(
            PropertyPath::Related {
                relation: relation.to_string(),
                attribute: attribute.to_string(),
            },
            condition,
        ))
    }

    /// Matches entities whose `relation` points at `id`.
    pub fn references(relation: &str, id: EntityId) -> Self {
        Self::Where(Clause::new(
            PropertyPath::Reference(relation.to_string()),
            // No stored entity can carry an identity beyond `i64::MAX`.
            id_value(id).map_or(Condition::In(Vec::new()), Condition::Equals),
        ))
    }

    pub fn and(self, other: Specification) -> Self {
        match (self, other) {
            (Self::All, other) => other,
            (this, Self::All) => this,
            (this, other) => Self::And(Box::new(this), Box::new(other)),
        }
    }

    pub fn or(self, other: Specification) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Checks every path and operand kind against `E`'s schema.
    pub fn validate<E: Entity>(&self) -> QueryResult<()> {
        match self {
            Self::All => Ok(()),
            Self::Where(clause) | Self::RequiredJoin(clause) => {
                let kind = clause.path.resolve_kind::<E>()?;
                clause.condition.check_kind(&clause.path.to_string(), kind)
            }
            Self::And(left, right) | Self::Or(left, right) => {
                left.validate::<E>()?;
                right.validate::<E>()
            }
            Self::Not(inner) => inner.validate::<E>(),
        }
    }

    /// Evaluates this predicate against one entity.
    pub fn matches<E: Entity>(
        &self,
        entity: &E,
        resolver: &dyn RelationResolver,
    ) -> RepoResult<bool> {
        match self {
            Self::All => Ok(true),
            Self::Where(clause) => test_clause(clause, entity, resolver, false),
            Self::RequiredJoin(clause) => test_clause(clause, entity, resolver, true),
            Self::And(left, right) => {
                Ok(left.matches(entity, resolver)? && right.matches(entity, resolver)?)
            }
            Self::Or(left, right) => {
                Ok(left.matches(entity, resolver)? || right.matches(entity, resolver)?)
            }
            Self::Not(inner) => Ok(!inner.matches(entity, resolver)?),
        }
    }
}

impl Display for Specification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("true"),
            Self::Where(clause) => write!(f, "{clause}"),
            Self::RequiredJoin(clause) => write!(f, "{clause} (required)"),
            Self::And(left, right) => write!(f, "({left} and {right})"),
            Self::Or(left, right) => write!(f, "({left} or {right})"),
            Self::Not(inner) => write!(f, "not {inner}"),
        }
    }
}

fn test_clause<E: Entity>(
    clause: &Clause,
    entity: &E,
    resolver: &dyn RelationResolver,
    required: bool,
) -> RepoResult<bool> {
    match &clause.path {
        PropertyPath::Attribute(name) => Ok(clause.condition.test(entity.attribute(name).as_ref())),
        PropertyPath::Reference(relation) => {
            let target = entity.reference(relation).and_then(id_value);
            Ok(clause.condition.test(target.as_ref()))
        }
        PropertyPath::Related {
            relation,
            attribute,
        } => {
            let Some(def) = E::relation_def(relation) else {
                return Ok(false);
            };
            let Some(target_id) = entity.reference(relation) else {
                if required {
                    return Err(RepoError::JoinTargetMissing {
                        relation: relation.clone(),
                        id: None,
                    });
                }
                return Ok(false);
            };
            let related = resolver.resolve(def.target, target_id).ok_or_else(|| {
                RepoError::JoinTargetMissing {
                    relation: relation.clone(),
                    id: Some(target_id),
                }
            })?;
            Ok(clause.condition.test(related.get(attribute.as_str())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RelationResolver, Specification};
    use crate::model::entity::{EntityId, EntityKind};
    use crate::model::member::Member;
    use crate::model::value::{AttrValue, AttributeMap};
    use crate::query::condition::Condition;
    use crate::query::QueryError;
    use crate::repo::RepoError;

    struct OneTeam;

    impl RelationResolver for OneTeam {
        fn resolve(&self, kind: EntityKind, id: EntityId) -> Option<AttributeMap> {
            (kind == EntityKind::Team && id == 1).then(|| {
                AttributeMap::from([("name".to_string(), AttrValue::from("teamA"))])
            })
        }
    }

    fn member(name: &str, team: Option<EntityId>) -> Member {
        let mut member = Member::new(name);
        member.team_id = team;
        member
    }

    #[test]
    fn composed_specification_requires_both_sides() {
        let spec = Specification::attribute("username", Condition::eq("m1"))
            .and(Specification::related("team", "name", Condition::eq("teamA")));

        assert!(spec.matches(&member("m1", Some(1)), &OneTeam).unwrap());
        assert!(!spec.matches(&member("m2", Some(1)), &OneTeam).unwrap());
        assert!(!spec.matches(&member("m1", None), &OneTeam).unwrap());
    }

    #[test]
    fn or_and_not_nest() {
        let spec = Specification::attribute("username", Condition::eq("m1"))
            .or(Specification::attribute("username", Condition::eq("m2")))
            .not();

        assert!(!spec.matches(&member("m2", None), &OneTeam).unwrap());
        assert!(spec.matches(&member("m3", None), &OneTeam).unwrap());
    }

    #[test]
    fn required_join_on_absent_reference_fails() {
        let spec = Specification::related_required("team", "name", Condition::eq("teamA"));
        let err = spec.matches(&member("m1", None), &OneTeam).unwrap_err();
        assert!(matches!(err, RepoError::JoinTargetMissing { id: None, .. }));
    }

    #[test]
    fn dangling_reference_fails_even_for_inner_join() {
        let spec = Specification::related("team", "name", Condition::eq("teamA"));
        let err = spec.matches(&member("m1", Some(9)), &OneTeam).unwrap_err();
        assert!(matches!(err, RepoError::JoinTargetMissing { id: Some(9), .. }));
    }

    #[test]
    fn validate_rejects_unknown_related_attribute() {
        let spec = Specification::related("team", "username", Condition::eq("x"));
        assert!(matches!(
            spec.validate::<Member>(),
            Err(QueryError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn and_with_all_collapses() {
        let clause = Specification::attribute("age", Condition::gt(3));
        assert_eq!(Specification::All.and(clause.clone()), clause);
    }

    #[test]
    fn reference_clause_with_oversized_identity_matches_nothing() {
        let spec = Specification::references("team", u64::MAX);
        assert!(!spec.matches(&member("m1", Some(u64::MAX)), &OneTeam).unwrap());
        assert!(Specification::references("team", 1)
            .matches(&member("m1", Some(1)), &OneTeam)
            .unwrap());
    }
}
