//! Link filters: predicates that narrow which requests a pool serves.
//!
//! A link may carry several pools whose ranges serve different classes of
//! client on the same segment (for example phones and cameras behind the
//! same relay). Each such pool names a filter; a request reaches the pool
//! only if every expression of that filter matches.

use serde::{Deserialize, Serialize};

use crate::request::Request;

/// How an expression compares a request attribute with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    /// Matches when the attribute is present, whatever its value.
    Exists,
}

/// One attribute test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExpression {
    pub attribute: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FilterExpression {
    pub fn matches(&self, request: &Request) -> bool {
        let Some(actual) = request.attribute(&self.attribute) else {
            return false;
        };
        let expected = self.value.as_deref().unwrap_or_default();
        match self.operator {
            FilterOperator::Equals => actual == expected,
            FilterOperator::StartsWith => actual.starts_with(expected),
            FilterOperator::EndsWith => actual.ends_with(expected),
            FilterOperator::Contains => actual.contains(expected),
            FilterOperator::Exists => true,
        }
    }
}

/// A named conjunction of expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFilter {
    pub name: String,
    pub expressions: Vec<FilterExpression>,
}

impl LinkFilter {
    /// Returns true if every expression matches the request.
    pub fn matches(&self, request: &Request) -> bool {
        self.expressions
            .iter()
            .all(|expression| expression.matches(request))
    }
}
