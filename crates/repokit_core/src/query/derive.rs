//! Method-name query derivation.
//!
//! # Responsibility
//! - Translate names like `findTop3ByUsernameAndAgeGreaterThanOrderByAgeDesc`
//!   into an unbound `QueryTemplate`.
//! - Bind positional arguments into a `QueryDescriptor`.
//!
//! # Invariants
//! - Property words resolve case-sensitively against the entity schema.
//! - A name using both `And` and `Or` is rejected.

use crate::model::entity::Entity;
use crate::query::condition::{Operator, QueryArg};
use crate::query::descriptor::{Connector, Direction, QueryAction, QueryDescriptor, SortOrder};
use crate::query::specification::Clause;
use crate::query::{PropertyPath, QueryError, QueryResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::{Display, Formatter};

static CAMEL_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\p{Lu}[^\p{Lu}]*").expect("valid camel word regex"));
static LIMIT_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:First|Top)(\d*)$").expect("valid limit regex"));

const PREFIXES: &[(&str, QueryAction)] = &[
    ("stream", QueryAction::Find),
    ("search", QueryAction::Find),
    ("exists", QueryAction::Exists),
    ("delete", QueryAction::Delete),
    ("remove", QueryAction::Delete),
    ("query", QueryAction::Find),
    ("count", QueryAction::Count),
    ("find", QueryAction::Find),
    ("read", QueryAction::Find),
    ("get", QueryAction::Find),
];

// Longest keyword first so `GreaterThanEqual` wins over `GreaterThan`.
const OPERATOR_KEYWORDS: &[(&[&str], Operator)] = &[
    (&["Greater", "Than", "Equal"], Operator::GreaterThanEqual),
    (&["Less", "Than", "Equal"], Operator::LessThanEqual),
    (&["Greater", "Than"], Operator::GreaterThan),
    (&["Less", "Than"], Operator::LessThan),
    (&["Starting", "With"], Operator::StartingWith),
    (&["Starts", "With"], Operator::StartingWith),
    (&["Ending", "With"], Operator::EndingWith),
    (&["Ends", "With"], Operator::EndingWith),
    (&["Not", "In"], Operator::NotIn),
    (&["Not", "Like"], Operator::NotLike),
    (&["After"], Operator::GreaterThan),
    (&["Before"], Operator::LessThan),
    (&["Between"], Operator::Between),
    (&["In"], Operator::In),
    (&["Like"], Operator::Like),
    (&["Containing"], Operator::Containing),
    (&["Contains"], Operator::Containing),
    (&["Not"], Operator::NotEquals),
    (&["Equals"], Operator::Equals),
    (&["Is"], Operator::Equals),
];

/// One derived clause before its arguments are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub path: PropertyPath,
    pub operator: Operator,
    pub ignore_case: bool,
}

/// Parsed method name, reusable across argument sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    pub method: String,
    pub action: QueryAction,
    pub distinct: bool,
    pub criteria: Vec<Criterion>,
    pub connector: Connector,
    pub sort: Vec<SortOrder>,
    pub limit: Option<usize>,
}

impl QueryTemplate {
    /// Total number of positional arguments expected by `bind`.
    pub fn arity(&self) -> usize {
        self.criteria
            .iter()
            .map(|criterion| criterion.operator.arity())
            .sum()
    }

    pub fn bind(&self, args: &[QueryArg]) -> QueryResult<QueryDescriptor> {
        if args.len() != self.arity() {
            return Err(QueryError::ArgumentCount {
                expected: self.arity(),
                actual: args.len(),
            });
        }

        let mut clauses = Vec::with_capacity(self.criteria.len());
        let mut offset = 0;
        for criterion in &self.criteria {
            let arity = criterion.operator.arity();
            let condition = criterion.operator.bind(
                &criterion.path.to_string(),
                &args[offset..offset + arity],
                criterion.ignore_case,
            )?;
            clauses.push(Clause::new(criterion.path.clone(), condition));
            offset += arity;
        }

        Ok(QueryDescriptor {
            action: self.action,
            distinct: self.distinct,
            clauses,
            connector: self.connector,
            restriction: None,
            sort: self.sort.clone(),
            limit: self.limit,
        })
    }
}

impl Display for QueryTemplate {
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
        if self.criteria.is_empty() {
            write!(f, " where true")?;
        }
        let joiner = match self.connector {
            Connector::And => " and ",
            Connector::Or => " or ",
        };
        let mut position = 1;
        for (index, criterion) in self.criteria.iter().enumerate() {
            f.write_str(if index == 0 { " where " } else { joiner })?;
            let params = (position..position + criterion.operator.arity())
                .map(|p| format!("?{p}"))
                .collect::<Vec<_>>()
                .join(" and ");
            position += criterion.operator.arity();
            write!(
                f,
                "{} {} {params}",
                criterion.path,
                criterion.operator.symbol()
            )?;
            if criterion.ignore_case {
                write!(f, " ignoring case")?;
            }
        }
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

/// Derives a query template for entity `E` from a method name.
///
/// # Errors
/// - `InvalidMethodName` for an unknown prefix or a malformed clause.
/// - `MixedConnectors` when both `And` and `Or` appear.
/// - `SchemaMismatch` when a property does not exist on `E`.
pub fn derive_query<E: Entity>(method: &str) -> QueryResult<QueryTemplate> {
    let invalid = |reason: &str| QueryError::InvalidMethodName {
        method: method.to_string(),
        reason: reason.to_string(),
    };

    let (rest, action) = PREFIXES
        .iter()
        .find_map(|(prefix, action)| method.strip_prefix(prefix).map(|rest| (rest, *action)))
        .ok_or_else(|| invalid("unknown prefix"))?;
    if rest.chars().next().is_some_and(|ch| !ch.is_uppercase()) {
        return Err(invalid("prefix must be followed by an upper-case word"));
    }

    let words = split_camel(rest);
    if words.concat() != rest {
        return Err(invalid("name contains characters outside camel-case words"));
    }
    let (subject, predicate) = match words.iter().position(|word| *word == "By") {
        Some(index) => (&words[..index], &words[index + 1..]),
        None => (&words[..], &words[words.len()..]),
    };

    let (distinct, limit) = parse_subject(subject).map_err(|reason| invalid(&reason))?;

    let (criteria_words, order_words) = match predicate
        .windows(2)
        .rposition(|pair| pair[0] == "Order" && pair[1] == "By")
    {
        Some(index) => (&predicate[..index], Some(&predicate[index + 2..])),
        None => (predicate, None),
    };

    let sort = match order_words {
        Some(words) => parse_order::<E>(words).map_err(|err| match err {
            QueryError::InvalidMethodName { reason, .. } => invalid(&reason),
            other => other,
        })?,
        None => Vec::new(),
    };

    let mut connector = None;
    let mut groups: Vec<Vec<&str>> = vec![Vec::new()];
    for word in criteria_words {
        let next = match *word {
            "And" => Connector::And,
            "Or" => Connector::Or,
            other => {
                if let Some(group) = groups.last_mut() {
                    group.push(other);
                }
                continue;
            }
        };
        match connector {
            Some(seen) if seen != next => {
                return Err(QueryError::MixedConnectors {
                    method: method.to_string(),
                })
            }
            _ => connector = Some(next),
        }
        groups.push(Vec::new());
    }

    let criteria = if criteria_words.is_empty() {
        Vec::new()
    } else {
        groups
            .iter()
            .map(|group| parse_criterion::<E>(group).map_err(|reason| match reason {
                QueryError::InvalidMethodName { reason, .. } => invalid(&reason),
                other => other,
            }))
            .collect::<QueryResult<Vec<_>>>()?
    };

    Ok(QueryTemplate {
        method: method.to_string(),
        action,
        distinct,
        criteria,
        connector: connector.unwrap_or_default(),
        sort,
        limit,
    })
}

fn split_camel(text: &str) -> Vec<&str> {
    CAMEL_WORD_RE.find_iter(text).map(|m| m.as_str()).collect()
}

fn uncapitalize(words: &[&str]) -> String {
    let joined = words.concat();
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn parse_subject(words: &[&str]) -> Result<(bool, Option<usize>), String> {
    let mut distinct = false;
    let mut limit = None;
    for word in words {
        if *word == "Distinct" {
            distinct = true;
        } else if let Some(captures) = LIMIT_WORD_RE.captures(word) {
            let digits = captures.get(1).map_or("", |m| m.as_str());
            let count = if digits.is_empty() {
                1
            } else {
                digits
                    .parse::<usize>()
                    .map_err(|_| format!("result limit `{word}` is out of range"))?
            };
            if count == 0 {
                return Err(format!("result limit `{word}` must be at least 1"));
            }
            limit = Some(count);
        }
    }
    Ok((distinct, limit))
}

fn parse_order<E: Entity>(words: &[&str]) -> QueryResult<Vec<SortOrder>> {
    let malformed = |reason: &str| QueryError::InvalidMethodName {
        method: String::new(),
        reason: reason.to_string(),
    };
    if words.is_empty() {
        return Err(malformed("OrderBy must name a property"));
    }

    let mut orders = Vec::new();
    let mut pending: Vec<&str> = Vec::new();
    for word in words {
        let direction = match *word {
            "Asc" => Direction::Asc,
            "Desc" => Direction::Desc,
            other => {
                pending.push(other);
                continue;
            }
        };
        if pending.is_empty() {
            return Err(malformed("sort direction without a property"));
        }
        orders.push(SortOrder {
            property: uncapitalize(&pending),
            direction,
        });
        pending.clear();
    }
    if !pending.is_empty() {
        orders.push(SortOrder::asc(uncapitalize(&pending)));
    }

    for order in &orders {
        if E::attribute_def(&order.property).is_none() {
            return Err(QueryError::SchemaMismatch {
                entity: E::KIND,
                path: order.property.clone(),
            });
        }
    }
    Ok(orders)
}

fn parse_criterion<E: Entity>(words: &[&str]) -> QueryResult<Criterion> {
    let malformed = |reason: &str| QueryError::InvalidMethodName {
        method: String::new(),
        reason: reason.to_string(),
    };
    if words.is_empty() {
        return Err(malformed("empty clause between connectors"));
    }

    let mut words = words;
    let mut ignore_case = false;
    if let [head @ .., "Ignore" | "Ignoring", "Case"] = words {
        ignore_case = true;
        words = head;
    }

    let mut operator = Operator::Equals;
    for (keyword, candidate) in OPERATOR_KEYWORDS {
        if words.len() > keyword.len() && words.ends_with(keyword) {
            operator = *candidate;
            words = &words[..words.len() - keyword.len()];
            if words.len() > 1 && words.last() == Some(&"Is") {
                words = &words[..words.len() - 1];
            }
            break;
        }
    }

    let path = resolve_property::<E>(words)?;
    if matches!(path, PropertyPath::Reference(_))
        && !matches!(operator, Operator::Equals | Operator::NotEquals | Operator::In | Operator::NotIn)
    {
        return Err(malformed("relations only support equality and membership"));
    }

    Ok(Criterion {
        path,
        operator,
        ignore_case,
    })
}

fn resolve_property<E: Entity>(words: &[&str]) -> QueryResult<PropertyPath> {
    let name = uncapitalize(words);
    if E::attribute_def(&name).is_some() {
        return Ok(PropertyPath::Attribute(name));
    }
    if E::relation_def(&name).is_some() {
        return Ok(PropertyPath::Reference(name));
    }

    for split in 1..words.len() {
        let relation = uncapitalize(&words[..split]);
        let attribute = uncapitalize(&words[split..]);
        let found = E::relation_def(&relation).and_then(|def| def.attribute(&attribute));
        if found.is_some() {
            return Ok(PropertyPath::Related {
                relation,
                attribute,
            });
        }
    }

    Err(QueryError::SchemaMismatch {
        entity: E::KIND,
        path: name,
    })
}
