// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scalar filter expressions: the subset the memory service needs —
//! equality, substring match, and conjunction.

/// One conjunction of scalar predicates over varchar fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Eq { field: String, value: String },
    EqInt { field: String, value: i64 },
    Like { field: String, substring: String },
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `field == "value"`
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push(Clause::Eq { field: field.into(), value: value.into() });
        self
    }

    /// `field == value` over an integer column (the primary id).
    pub fn eq_int(mut self, field: impl Into<String>, value: i64) -> Self {
        self.clauses.push(Clause::EqInt { field: field.into(), value });
        self
    }

    /// `field like "%substring%"`
    pub fn like(mut self, field: impl Into<String>, substring: impl Into<String>) -> Self {
        self.clauses.push(Clause::Like { field: field.into(), substring: substring.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Conjoin another filter's clauses onto this one.
    pub fn merge(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    /// Render the boolean expression the vector database evaluates.
    pub fn to_expr(&self) -> String {
        self.clauses
            .iter()
            .map(|c| match c {
                Clause::Eq { field, value } => format!("{field} == \"{}\"", escape(value)),
                Clause::EqInt { field, value } => format!("{field} == {value}"),
                Clause::Like { field, substring } => {
                    format!("{field} like \"%{}%\"", escape(substring))
                }
            })
            .collect::<Vec<_>>()
            .join(" and ")
    }

    /// Evaluate against a field lookup; used by the in-memory store.
    pub(crate) fn matches(&self, lookup: &dyn Fn(&str) -> Option<String>) -> bool {
        self.clauses.iter().all(|c| match c {
            Clause::Eq { field, value } => lookup(field).as_deref() == Some(value.as_str()),
            Clause::EqInt { field, value } => {
                lookup(field).as_deref() == Some(value.to_string().as_str())
            }
            Clause::Like { field, substring } => {
                lookup(field).map(|v| v.contains(substring.as_str())).unwrap_or(false)
            }
        })
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_renders_empty_expr() {
        assert!(Filter::new().is_empty());
        assert_eq!(Filter::new().to_expr(), "");
    }

    #[test]
    fn eq_clause_renders_quoted() {
        let f = Filter::new().eq("session_id", "abc-1");
        assert_eq!(f.to_expr(), r#"session_id == "abc-1""#);
    }

    #[test]
    fn like_clause_renders_percent_wrapped() {
        let f = Filter::new().like("content", "rust");
        assert_eq!(f.to_expr(), r#"content like "%rust%""#);
    }

    #[test]
    fn clauses_join_with_and() {
        let f = Filter::new().eq("user_id", "u1").eq("memory_type", "SEMANTIC");
        assert_eq!(f.to_expr(), r#"user_id == "u1" and memory_type == "SEMANTIC""#);
    }

    #[test]
    fn quotes_in_literals_are_escaped() {
        let f = Filter::new().eq("content", r#"say "hi""#);
        assert_eq!(f.to_expr(), r#"content == "say \"hi\"""#);
    }

    #[test]
    fn matches_conjunction_semantics() {
        let f = Filter::new().eq("a", "1").like("b", "ell");
        let hit = |field: &str| match field {
            "a" => Some("1".to_string()),
            "b" => Some("hello".to_string()),
            _ => None,
        };
        let miss = |field: &str| match field {
            "a" => Some("1".to_string()),
            "b" => Some("world".to_string()),
            _ => None,
        };
        assert!(f.matches(&hit));
        assert!(!f.matches(&miss));
    }

    #[test]
    fn missing_field_never_matches() {
        let f = Filter::new().eq("ghost", "x");
        assert!(!f.matches(&|_| None));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::new().matches(&|_| None));
    }

    #[test]
    fn eq_int_renders_unquoted() {
        let f = Filter::new().eq_int("id", 42).eq("user_id", "u1");
        assert_eq!(f.to_expr(), r#"id == 42 and user_id == "u1""#);
    }

    #[test]
    fn eq_int_matches_numeric_field() {
        let f = Filter::new().eq_int("id", 7);
        assert!(f.matches(&|field| (field == "id").then(|| "7".to_string())));
        assert!(!f.matches(&|field| (field == "id").then(|| "8".to_string())));
    }
}
