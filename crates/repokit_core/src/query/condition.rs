//! Comparison operators, bound conditions and text patterns.
//!
//! # Invariants
//! - A missing value never satisfies any condition, negated ones included.
//! - Ordering comparisons only succeed between values of the same kind.

use crate::model::value::{AttrKind, AttrValue};
use crate::query::{QueryError, QueryResult};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Operator recognized by method-name derivation, before arguments are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    Between,
    In,
    NotIn,
    Like,
    NotLike,
    StartingWith,
    EndingWith,
    Containing,
}

impl Operator {
    /// Number of positional arguments consumed when binding.
    pub fn arity(self) -> usize {
        match self {
            Self::Between => 2,
            _ => 1,
        }
    }

    fn is_textual(self) -> bool {
        matches!(
            self,
            Self::Like | Self::NotLike | Self::StartingWith | Self::EndingWith | Self::Containing
        )
    }

    /// Binds `args` (exactly `arity()` of them) into a condition on `path`.
    pub fn bind(self, path: &str, args: &[QueryArg], ignore_case: bool) -> QueryResult<Condition> {
        if args.len() != self.arity() {
            return Err(QueryError::ArgumentCount {
                expected: self.arity(),
                actual: args.len(),
            });
        }

        match self {
            Self::In => return Ok(Condition::In(args[0].to_list())),
            Self::NotIn => return Ok(Condition::NotIn(args[0].to_list())),
            Self::Between => {
                return Ok(Condition::Between(
                    args[0].single(path)?,
                    args[1].single(path)?,
                ))
            }
            _ => {}
        }

        let value = args[0].single(path)?;
        if self.is_textual() || (ignore_case && matches!(self, Self::Equals | Self::NotEquals)) {
            let Some(text) = value.as_text() else {
                return Err(QueryError::TypeMismatch {
                    path: path.to_string(),
                    expected: AttrKind::Text,
                    actual: value.kind(),
                });
            };
            let condition = match self {
                Self::Equals => Condition::Matches(TextPattern::exact(text, true)?),
                Self::NotEquals => Condition::NotMatches(TextPattern::exact(text, true)?),
                Self::Like => Condition::Matches(TextPattern::like(text, ignore_case)?),
                Self::NotLike => Condition::NotMatches(TextPattern::like(text, ignore_case)?),
                Self::StartingWith => {
                    Condition::Matches(TextPattern::starting_with(text, ignore_case)?)
                }
                Self::EndingWith => Condition::Matches(TextPattern::ending_with(text, ignore_case)?),
                _ => Condition::Matches(TextPattern::containing(text, ignore_case)?),
            };
            return Ok(condition);
        }

        Ok(match self {
            Self::NotEquals => Condition::NotEquals(value),
            Self::GreaterThan => Condition::GreaterThan(value),
            Self::GreaterThanEqual => Condition::GreaterThanEqual(value),
            Self::LessThan => Condition::LessThan(value),
            Self::LessThanEqual => Condition::LessThanEqual(value),
            _ => Condition::Equals(value),
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::NotEquals => "<>",
            Self::GreaterThan => ">",
            Self::GreaterThanEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanEqual => "<=",
            Self::Between => "between",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Like => "like",
            Self::NotLike => "not like",
            Self::StartingWith => "starting with",
            Self::EndingWith => "ending with",
            Self::Containing => "containing",
        }
    }
}

/// Positional argument for a derived query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryArg {
    Value(AttrValue),
    List(Vec<AttrValue>),
}

impl QueryArg {
    pub fn list<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    fn single(&self, path: &str) -> QueryResult<AttrValue> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::List(_) => Err(QueryError::InvalidMethodName {
                method: path.to_string(),
                reason: "a list argument is only accepted by In/NotIn".to_string(),
            }),
        }
    }

    fn to_list(&self) -> Vec<AttrValue> {
        match self {
            Self::Value(value) => vec![value.clone()],
            Self::List(values) => values.clone(),
        }
    }
}

impl From<AttrValue> for QueryArg {
    fn from(value: AttrValue) -> Self {
        Self::Value(value)
    }
}

impl From<i64> for QueryArg {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<i32> for QueryArg {
    fn from(value: i32) -> Self {
        Self::Value(value.into())
    }
}

impl From<&str> for QueryArg {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for QueryArg {
    fn from(value: String) -> Self {
        Self::Value(value.into())
    }
}

impl From<Vec<AttrValue>> for QueryArg {
    fn from(values: Vec<AttrValue>) -> Self {
        Self::List(values)
    }
}

impl From<Vec<&str>> for QueryArg {
    fn from(values: Vec<&str>) -> Self {
        Self::list(values)
    }
}

/// Compiled text-matching pattern; equality compares the source form only.
#[derive(Debug, Clone)]
pub struct TextPattern {
    source: String,
    regex: Regex,
}

impl PartialEq for TextPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl TextPattern {
    /// SQL `LIKE` semantics: `%` matches any run, `_` matches one character.
    pub fn like(pattern: &str, ignore_case: bool) -> QueryResult<Self> {
        let mut body = String::with_capacity(pattern.len() * 2);
        for ch in pattern.chars() {
            match ch {
                '%' => body.push_str(".*"),
                '_' => body.push('.'),
                other => body.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        Self::compile(format!("like {pattern:?}"), &body, ignore_case)
    }

    pub fn exact(value: &str, ignore_case: bool) -> QueryResult<Self> {
        Self::compile(
            format!("= {value:?}"),
            &regex::escape(value),
            ignore_case,
        )
    }

    pub fn starting_with(value: &str, ignore_case: bool) -> QueryResult<Self> {
        Self::compile(
            format!("starting with {value:?}"),
            &format!("{}.*", regex::escape(value)),
            ignore_case,
        )
    }

    pub fn ending_with(value: &str, ignore_case: bool) -> QueryResult<Self> {
        Self::compile(
            format!("ending with {value:?}"),
            &format!(".*{}", regex::escape(value)),
            ignore_case,
        )
    }

    pub fn containing(value: &str, ignore_case: bool) -> QueryResult<Self> {
        Self::compile(
            format!("containing {value:?}"),
            &format!(".*{}.*", regex::escape(value)),
            ignore_case,
        )
    }

    fn compile(source: String, body: &str, ignore_case: bool) -> QueryResult<Self> {
        let flags = if ignore_case { "(?is)" } else { "(?s)" };
        let regex = Regex::new(&format!("^{flags}{body}$")).map_err(|err| {
            QueryError::InvalidPattern {
                pattern: source.clone(),
                message: err.to_string(),
            }
        })?;
        let source = if ignore_case {
            format!("{source} ignoring case")
        } else {
            source
        };
        Ok(Self { source, regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Operator with its bound operand(s).
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(AttrValue),
    NotEquals(AttrValue),
    GreaterThan(AttrValue),
    GreaterThanEqual(AttrValue),
    LessThan(AttrValue),
    LessThanEqual(AttrValue),
    Between(AttrValue, AttrValue),
    In(Vec<AttrValue>),
    NotIn(Vec<AttrValue>),
    Matches(TextPattern),
    NotMatches(TextPattern),
}

impl Condition {
    pub fn eq(value: impl Into<AttrValue>) -> Self {
        Self::Equals(value.into())
    }

    pub fn gt(value: impl Into<AttrValue>) -> Self {
        Self::GreaterThan(value.into())
    }

    pub fn lt(value: impl Into<AttrValue>) -> Self {
        Self::LessThan(value.into())
    }

    pub fn between(low: impl Into<AttrValue>, high: impl Into<AttrValue>) -> Self {
        Self::Between(low.into(), high.into())
    }

    pub fn one_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        Self::In(values.into_iter().map(Into::into).collect())
    }

    pub fn like(pattern: &str) -> QueryResult<Self> {
        Ok(Self::Matches(TextPattern::like(pattern, false)?))
    }

    /// Tests `actual`; `None` means the property has no value.
    pub fn test(&self, actual: Option<&AttrValue>) -> bool {
        let Some(actual) = actual else {
            return false;
        };

        match self {
            Self::Equals(expected) => actual == expected,
            Self::NotEquals(expected) => actual.kind() == expected.kind() && actual != expected,
            Self::GreaterThan(bound) => actual.compare(bound) == Some(Ordering::Greater),
            Self::GreaterThanEqual(bound) => matches!(
                actual.compare(bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::LessThan(bound) => actual.compare(bound) == Some(Ordering::Less),
            Self::LessThanEqual(bound) => matches!(
                actual.compare(bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Between(low, high) => {
                matches!(
                    actual.compare(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    actual.compare(high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            Self::In(values) => values.contains(actual),
            Self::NotIn(values) => !values.contains(actual),
            Self::Matches(pattern) => actual.as_text().is_some_and(|text| pattern.is_match(text)),
            Self::NotMatches(pattern) => {
                actual.as_text().is_some_and(|text| !pattern.is_match(text))
            }
        }
    }

    /// Checks operand kinds against the declared kind of the property.
    pub(crate) fn check_kind(&self, path: &str, kind: AttrKind) -> QueryResult<()> {
        let mismatch = |actual: AttrKind| QueryError::TypeMismatch {
            path: path.to_string(),
            expected: kind,
            actual,
        };

        match self {
            Self::Matches(_) | Self::NotMatches(_) => {
                if kind != AttrKind::Text {
                    return Err(QueryError::TypeMismatch {
                        path: path.to_string(),
                        expected: kind,
                        actual: AttrKind::Text,
                    });
                }
                Ok(())
            }
            _ => {
                for value in self.operands() {
                    if value.kind() != kind {
                        return Err(mismatch(value.kind()));
                    }
                }
                Ok(())
            }
        }
    }

    fn operands(&self) -> Vec<&AttrValue> {
        match self {
            Self::Equals(value)
            | Self::NotEquals(value)
            | Self::GreaterThan(value)
            | Self::GreaterThanEqual(value)
            | Self::LessThan(value)
            | Self::LessThanEqual(value) => vec![value],
            Self::Between(low, high) => vec![low, high],
            Self::In(values) | Self::NotIn(values) => values.iter().collect(),
            Self::Matches(_) | Self::NotMatches(_) => Vec::new(),
        }
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let list = |values: &[AttrValue]| {
            values
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::Equals(value) => write!(f, "= {value}"),
            Self::NotEquals(value) => write!(f, "<> {value}"),
            Self::GreaterThan(value) => write!(f, "> {value}"),
            Self::GreaterThanEqual(value) => write!(f, ">= {value}"),
            Self::LessThan(value) => write!(f, "< {value}"),
            Self::LessThanEqual(value) => write!(f, "<= {value}"),
            Self::Between(low, high) => write!(f, "between {low} and {high}"),
            Self::In(values) => write!(f, "in ({})", list(values)),
            Self::NotIn(values) => write!(f, "not in ({})", list(values)),
            Self::Matches(pattern) => f.write_str(pattern.source()),
            Self::NotMatches(pattern) => write!(f, "not {}", pattern.source()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Condition, Operator, QueryArg, TextPattern};
    use crate::model::value::{AttrKind, AttrValue};
    use crate::query::QueryError;

    #[test]
    fn like_translates_sql_wildcards_and_escapes_the_rest() {
        let pattern = TextPattern::like("m_mber%", false).unwrap();
        assert!(pattern.is_match("member1"));
        assert!(pattern.is_match("mamber"));
        assert!(!pattern.is_match("xmember"));

        let dotted = TextPattern::like("a.b", false).unwrap();
        assert!(dotted.is_match("a.b"));
        assert!(!dotted.is_match("axb"));
    }

    #[test]
    fn missing_value_never_matches_even_negated() {
        assert!(!Condition::NotEquals(AttrValue::from(1)).test(None));
        assert!(!Condition::NotIn(vec![AttrValue::from(1)]).test(None));
    }

    #[test]
    fn between_is_inclusive() {
        let condition = Condition::between(10, 20);
        assert!(condition.test(Some(&AttrValue::from(10))));
        assert!(condition.test(Some(&AttrValue::from(20))));
        assert!(!condition.test(Some(&AttrValue::from(21))));
    }

    #[test]
    fn bind_rejects_text_operator_on_integer_argument() {
        let err = Operator::Like
            .bind("username", &[QueryArg::from(5)], false)
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::TypeMismatch {
                path: "username".to_string(),
                expected: AttrKind::Text,
                actual: AttrKind::Int,
            }
        );
    }

    #[test]
    fn equals_ignoring_case_becomes_pattern() {
        let condition = Operator::Equals
            .bind("username", &[QueryArg::from("AAA")], true)
            .unwrap();
        assert!(condition.test(Some(&AttrValue::from("aaa"))));
        assert!(!condition.test(Some(&AttrValue::from("aaab"))));
    }

    #[test]
    fn check_kind_reports_operand_mismatch() {
        let err = Condition::gt("x").check_kind("age", AttrKind::Int).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { actual: AttrKind::Text, .. }));
    }
}
