//! A small SELECT builder
//!
//! Predicates are written with `?` placeholders and numbered (`$1`, `$2`, ...)
//! only when the statement is rendered, so independent callers (request
//! filters, access control) can append to the same query in any order.

use chrono::{DateTime, Utc};
use std::fmt;

/// A bound argument
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Timestamp(DateTime<Utc>),
    TextList(Vec<String>),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Timestamp(ts) => write!(f, "'{}'", ts.to_rfc3339()),
            SqlValue::TextList(values) => {
                let quoted: Vec<String> = values
                    .iter()
                    .map(|v| format!("'{}'", v.replace('\'', "''")))
                    .collect();
                write!(f, "({})", quoted.join(","))
            }
        }
    }
}

/// One WHERE conjunct
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    sql: String,
    args: Vec<SqlValue>,
}

impl Predicate {
    pub fn new(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// `column IN (...)`; a single `TextList` argument expands to one placeholder per value.
    /// An empty list matches no row.
    pub fn any_of(column: &str, values: &[String]) -> Self {
        if values.is_empty() {
            return Self::new("FALSE", Vec::new());
        }
        Self::new(format!("{column} IN ?"), vec![SqlValue::TextList(values.to_vec())])
    }

    /// OR of several predicates, parenthesized
    pub fn or(parts: Vec<Predicate>) -> Self {
        let sql = parts
            .iter()
            .map(|p| p.sql.as_str())
            .collect::<Vec<_>>()
            .join(" OR ");
        let args = parts.into_iter().flat_map(|p| p.args).collect();
        Self { sql, args }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// SELECT over a fixed FROM/JOIN clause
#[derive(Debug, Clone)]
pub struct SelectQuery {
    columns: String,
    from: String,
    predicates: Vec<Predicate>,
    order: Option<(String, SortOrder)>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl SelectQuery {
    pub fn new(columns: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            columns: columns.into(),
            from: from.into(),
            predicates: Vec::new(),
            order: None,
            limit: None,
            offset: None,
        }
    }

    pub fn filter(&mut self, predicate: Predicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    pub fn where_sql(&mut self, sql: impl Into<String>, args: Vec<SqlValue>) -> &mut Self {
        self.filter(Predicate::new(sql, args))
    }

    pub fn order_by(&mut self, column: impl Into<String>, order: SortOrder) -> &mut Self {
        self.order = Some((column.into(), order));
        self
    }

    pub fn page(&mut self, limit: i64, offset: i64) -> &mut Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    fn where_clause<F>(&self, mut placeholder: F) -> (String, Vec<SqlValue>)
    where
        F: FnMut(&SqlValue) -> String,
    {
        if self.predicates.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut args = Vec::new();
        let mut parts = Vec::with_capacity(self.predicates.len());
        for predicate in &self.predicates {
            let mut rendered = String::with_capacity(predicate.sql.len());
            let mut values = predicate.args.iter();
            for ch in predicate.sql.chars() {
                if ch != '?' {
                    rendered.push(ch);
                    continue;
                }
                match values.next() {
                    Some(value) => {
                        rendered.push_str(&placeholder(value));
                        args.push(value.clone());
                    }
                    None => rendered.push(ch),
                }
            }
            parts.push(format!("({rendered})"));
        }
        (format!(" WHERE {}", parts.join(" AND ")), args)
    }

    fn numbered(&self) -> (String, Vec<SqlValue>) {
        let mut n = 0usize;
        self.where_clause(|value| match value {
            SqlValue::TextList(values) => {
                let slots: Vec<String> = values
                    .iter()
                    .map(|_| {
                        n += 1;
                        format!("${n}")
                    })
                    .collect();
                format!("({})", slots.join(", "))
            }
            _ => {
                n += 1;
                format!("${n}")
            }
        })
    }

    /// Statement text and arguments in bind order; lists are flattened
    pub fn render(&self) -> (String, Vec<SqlValue>) {
        let (clause, args) = self.numbered();
        let mut sql = format!("SELECT {} FROM {}{}", self.columns, self.from, clause);
        if let Some((column, order)) = &self.order {
            sql.push_str(&format!(" ORDER BY {} {}", column, order.as_sql()));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        (sql, flatten(args))
    }

    /// `SELECT COUNT(*)` over the same filters
    pub fn render_count(&self) -> (String, Vec<SqlValue>) {
        let (clause, args) = self.numbered();
        (
            format!("SELECT COUNT(*) FROM {}{}", self.from, clause),
            flatten(args),
        )
    }

    /// The WHERE clause with literals inlined, for logs and tests
    pub fn describe(&self) -> String {
        let (clause, _) = self.where_clause(|value| value.to_string());
        clause.trim_start().trim_start_matches("WHERE ").to_string()
    }
}

fn flatten(args: Vec<SqlValue>) -> Vec<SqlValue> {
    args.into_iter()
        .flat_map(|arg| match arg {
            SqlValue::TextList(values) => values.into_iter().map(SqlValue::Text).collect(),
            other => vec![other],
        })
        .collect()
}
