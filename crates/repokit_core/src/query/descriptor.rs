//! Explicit query descriptor shared by the textual and structured surfaces.

use crate::model::entity::Entity;
use crate::query::condition::Condition;
use crate::query::specification::{Clause, Specification};
use crate::query::{PropertyPath, QueryError, QueryResult};
use std::fmt::{Display, Formatter};

/// What the repository does with the matching entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    Find,
    Count,
    Exists,
    Delete,
}

/// How top-level clauses are combined. Never mixed within one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connector {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Sort on one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub property: String,
    pub direction: Direction,
}

impl SortOrder {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

impl Display for SortOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let direction = match self.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        write!(f, "{} {direction}", self.property)
    }
}

/// Normalized query: clauses, optional grouped restriction, sort and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub action: QueryAction,
    /// Rows are unique by identity already; kept for descriptor fidelity.
    pub distinct: bool,
    pub clauses: Vec<Clause>,
    pub connector: Connector,
    /// Extra predicate ANDed with the clause chain, for explicit grouping.
    pub restriction: Option<Specification>,
    pub sort: Vec<SortOrder>,
    pub limit: Option<usize>,
}

impl QueryDescriptor {
    pub fn new(action: QueryAction) -> Self {
        Self {
            action,
            distinct: false,
            clauses: Vec::new(),
            connector: Connector::And,
            restriction: None,
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn find() -> Self {
        Self::new(QueryAction::Find)
    }

    pub fn count() -> Self {
        Self::new(QueryAction::Count)
    }

    pub fn filter(mut self, path: impl Into<PropertyPath>, condition: Condition) -> Self {
        self.clauses.push(Clause::new(path, condition));
        self
    }

    /// Combines the top-level clauses with OR instead of AND.
    pub fn any_of(mut self) -> Self {
        self.connector = Connector::Or;
        self
    }

    pub fn restrict(mut self, specification: Specification) -> Self {
        self.restriction = Some(match self.restriction.take() {
            Some(existing) => existing.and(specification),
            None => specification,
        });
        self
    }

    pub fn order_by(mut self, order: SortOrder) -> Self {
        self.sort.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Folds the clause chain strictly left to right, then applies the
    /// restriction. Zero clauses yield the always-true predicate.
    pub fn specification(&self) -> Specification {
        let chained = self
            .clauses
            .iter()
            .cloned()
            .map(Specification::Where)
            .reduce(|acc, next| match self.connector {
                Connector::And => acc.and(next),
                Connector::Or => acc.or(next),
            })
            .unwrap_or(Specification::All);

        match &self.restriction {
            Some(restriction) => chained.and(restriction.clone()),
            None => chained,
        }
    }

    pub fn validate<E: Entity>(&self) -> QueryResult<()> {
        self.specification().validate::<E>()?;
        validate_sort::<E>(&self.sort)
    }
}

impl Display for QueryDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let action = match self.action {
            QueryAction::Find => "find",
            QueryAction::Count => "count",
            QueryAction::Exists => "exists",
            QueryAction::Delete => "delete",
        };
        write!(f, "{action}")?;
        if self.distinct {
            write!(f, " distinct")?;
        }
        write!(f, " where {}", self.specification())?;
        if !self.sort.is_empty() {
            let orders = self
                .sort
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " order by {orders}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

/// Sort orders may only reference the entity's own attributes.
pub(crate) fn validate_sort<E: Entity>(orders: &[SortOrder]) -> QueryResult<()> {
    for order in orders {
        if E::attribute_def(&order.property).is_none() {
            return Err(QueryError::SchemaMismatch {
                entity: E::KIND,
                path: order.property.clone(),
            });
        }
    }
    Ok(())
}
