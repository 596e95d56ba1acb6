//! Query-by-example: template values plus matcher rules.
//!
//! # Invariants
//! - Unset example values never contribute a clause.
//! - Ignoring a relation name ignores every nested path under it.
//! - An example with nothing left to match is an error, not a match-all.

use crate::model::entity::Entity;
use crate::model::value::AttrValue;
use crate::query::condition::{Condition, TextPattern};
use crate::query::specification::{Clause, Specification};
use crate::query::PropertyPath;
use crate::repo::{RepoError, RepoResult};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;

/// Example slot: either a real value or the "unset" marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExampleValue {
    Unset,
    Set(AttrValue),
}

impl From<Option<AttrValue>> for ExampleValue {
    fn from(value: Option<AttrValue>) -> Self {
        match value {
            Some(value) => Self::Set(value),
            None => Self::Unset,
        }
    }
}

/// How text example values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringMatcher {
    #[default]
    Exact,
    StartingWith,
    EndingWith,
    Containing,
}

/// Matching rules applied to an example.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExampleMatcher {
    ignored_paths: BTreeSet<String>,
    string_matcher: StringMatcher,
    ignore_case: bool,
}

impl ExampleMatcher {
    pub fn matching() -> Self {
        Self::default()
    }

    pub fn with_ignore_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_string_matcher(mut self, matcher: StringMatcher) -> Self {
        self.string_matcher = matcher;
        self
    }

    pub fn with_ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        if self.ignored_paths.contains(path) {
            return true;
        }
        path.split_once('.')
            .is_some_and(|(relation, _)| self.ignored_paths.contains(relation))
    }

    fn condition_for(&self, value: &AttrValue) -> RepoResult<Condition> {
        let AttrValue::Text(text) = value else {
            return Ok(Condition::Equals(value.clone()));
        };
        if self.string_matcher == StringMatcher::Exact && !self.ignore_case {
            return Ok(Condition::Equals(value.clone()));
        }
        let pattern = match self.string_matcher {
            StringMatcher::Exact => TextPattern::exact(text, self.ignore_case),
            StringMatcher::StartingWith => TextPattern::starting_with(text, self.ignore_case),
            StringMatcher::EndingWith => TextPattern::ending_with(text, self.ignore_case),
            StringMatcher::Containing => TextPattern::containing(text, self.ignore_case),
        }?;
        Ok(Condition::Matches(pattern))
    }
}

/// Partially populated template for entity `E`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example<E> {
    values: BTreeMap<String, ExampleValue>,
    matcher: ExampleMatcher,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Example<E> {
    /// Example with every attribute unset.
    pub fn empty() -> Self {
        let values = E::ATTRIBUTES
            .iter()
            .map(|def| (def.name.to_string(), ExampleValue::Unset))
            .collect();
        Self {
            values,
            matcher: ExampleMatcher::default(),
            _entity: PhantomData,
        }
    }

    /// Example taken from an entity; an unassigned identity stays unset.
    pub fn of(entity: &E) -> Self {
        let mut example = Self::empty();
        for def in E::ATTRIBUTES {
            example
                .values
                .insert(def.name.to_string(), entity.attribute(def.name).into());
        }
        example
    }

    /// Adds nested example values for the entity referenced by `relation`.
    pub fn with_related<R: Entity>(mut self, relation: &str, related: &R) -> Self {
        for def in R::ATTRIBUTES {
            self.values.insert(
                format!("{relation}.{}", def.name),
                related.attribute(def.name).into(),
            );
        }
        self
    }

    pub fn set(mut self, path: &str, value: impl Into<AttrValue>) -> Self {
        self.values
            .insert(path.to_string(), ExampleValue::Set(value.into()));
        self
    }

    pub fn unset(mut self, path: &str) -> Self {
        self.values.insert(path.to_string(), ExampleValue::Unset);
        self
    }

    pub fn matching(mut self, matcher: ExampleMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn values(&self) -> &BTreeMap<String, ExampleValue> {
        &self.values
    }

    /// Builds the AND predicate over every set, non-ignored path.
    ///
    /// # Errors
    /// - `EmptyExample` when no path survives the exclusions.
    pub fn to_specification(&self) -> RepoResult<Specification> {
        let mut specification = Specification::All;
        let mut matched = 0usize;

        for (path, value) in &self.values {
            let ExampleValue::Set(value) = value else {
                continue;
            };
            if self.matcher.is_ignored(path) {
                continue;
            }
            let condition = self.matcher.condition_for(value)?;
            specification =
                specification.and(Specification::Where(Clause::new(PropertyPath::parse(path), condition)));
            matched += 1;
        }

        if matched == 0 {
            return Err(RepoError::EmptyExample);
        }
        Ok(specification)
    }
}
