//! Filter types for fragment queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Filter operator for payload queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to.
    Eq(Value),
    /// Not equal to.
    Ne(Value),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal to.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal to.
    Lte(Value),
    /// In list.
    In(Vec<Value>),
    /// Field is present and non-null.
    Exists,
    /// Field is absent, null, or an empty string/array.
    NotExists,
}

/// A single filter condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterCondition {
    /// Field name to filter on.
    pub field: String,
    /// Operator to apply.
    pub operator: FilterOperator,
}

impl FilterCondition {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Eq(value.into()),
        }
    }

    /// Create an inequality filter.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Ne(value.into()),
        }
    }

    /// Create an in-list filter.
    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::In(values),
        }
    }

    /// Create an exists filter.
    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Exists,
        }
    }

    /// Create a not-exists filter.
    pub fn not_exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::NotExists,
        }
    }

    /// Evaluate this condition against a payload.
    pub fn matches(&self, payload: &HashMap<String, Value>) -> bool {
        let value = payload.get(&self.field).filter(|v| !v.is_null());
        match &self.operator {
            FilterOperator::Eq(expected) => value.is_some_and(|v| json_eq(v, expected)),
            FilterOperator::Ne(expected) => !value.is_some_and(|v| json_eq(v, expected)),
            FilterOperator::Gt(bound) => compare(value, bound) == Some(Ordering::Greater),
            FilterOperator::Gte(bound) => matches!(
                compare(value, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt(bound) => compare(value, bound) == Some(Ordering::Less),
            FilterOperator::Lte(bound) => {
                matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOperator::In(values) => {
                value.is_some_and(|v| values.iter().any(|candidate| json_eq(v, candidate)))
            }
            FilterOperator::Exists => value.is_some_and(|v| !is_empty_value(v)),
            FilterOperator::NotExists => value.map_or(true, is_empty_value),
        }
    }
}

/// Composite filter with AND/OR/NOT logic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Filter {
    /// Single condition.
    Condition(FilterCondition),
    /// AND of multiple filters.
    And(Vec<Filter>),
    /// OR of multiple filters.
    Or(Vec<Filter>),
    /// NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Condition(FilterCondition::eq(field, value))
    }

    /// Create an inequality filter.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Condition(FilterCondition::ne(field, value))
    }

    /// Create an AND filter.
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    /// Create an OR filter.
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Create a NOT filter.
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Create an in-list filter.
    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::Condition(FilterCondition::in_list(field, values))
    }

    /// Create a range filter, inclusive on both ends.
    pub fn between(field: impl Into<String>, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        let field = field.into();
        Filter::And(vec![
            Filter::Condition(FilterCondition {
                field: field.clone(),
                operator: FilterOperator::Gte(min.into()),
            }),
            Filter::Condition(FilterCondition {
                field,
                operator: FilterOperator::Lte(max.into()),
            }),
        ])
    }

    /// Create an exists filter.
    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Condition(FilterCondition::exists(field))
    }

    /// Create a not-exists filter.
    pub fn not_exists(field: impl Into<String>) -> Self {
        Filter::Condition(FilterCondition::not_exists(field))
    }

    /// Evaluate the filter against a payload.
    pub fn matches(&self, payload: &HashMap<String, Value>) -> bool {
        match self {
            Filter::Condition(condition) => condition.matches(payload),
            Filter::And(filters) => filters.iter().all(|f| f.matches(payload)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(payload)),
            Filter::Not(inner) => !inner.matches(payload),
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

// Integer payloads round-trip through some stores as floats, so numbers
// compare by value rather than by representation.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(value: Option<&Value>, bound: &Value) -> Option<Ordering> {
    let value = value?;
    match (value.as_f64(), bound.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (value.as_str(), bound.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_eq_matches_numbers_across_representations() {
        let p = payload(&[("consolidation_level", json!(1.0))]);
        assert!(Filter::eq("consolidation_level", 1).matches(&p));
        assert!(!Filter::eq("consolidation_level", 2).matches(&p));
    }

    #[test]
    fn test_not_exists_treats_null_and_empty_as_absent() {
        let f = Filter::not_exists("superseded_by");
        assert!(f.matches(&payload(&[])));
        assert!(f.matches(&payload(&[("superseded_by", Value::Null)])));
        assert!(f.matches(&payload(&[("superseded_by", json!(""))])));
        assert!(!f.matches(&payload(&[("superseded_by", json!("abc"))])));
    }

    #[test]
    fn test_composite_filters() {
        let p = payload(&[("consolidation_level", json!(0)), ("content", json!("x"))]);
        let f = Filter::and(vec![
            Filter::eq("consolidation_level", 0),
            Filter::not_exists("superseded_by"),
        ]);
        assert!(f.matches(&p));
        assert!(!Filter::not(f.clone()).matches(&p));
        assert!(Filter::or(vec![Filter::eq("content", "y"), Filter::exists("content")]).matches(&p));
        assert!(Filter::between("consolidation_level", 0, 3).matches(&p));
    }
}
