//! Declarative query descriptors and opaque cursors.
//!
//! Every builder method takes `&self` and returns a new [`Query`]; the
//! receiver is never mutated, so a base query can be reused across
//! variations. Construction errors (a malformed filter string, an invalid
//! cursor) are deferred and reported when the query runs.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{CursorBound, QueryError};
use crate::key::Key;
use crate::value::Value;

// ============================================================================
// FILTERS AND ORDERS
// ============================================================================

/// Comparison operator of a property filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    /// Equal to
    Eq,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

impl FilterOp {
    fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "=" => Some(FilterOp::Eq),
            "<" => Some(FilterOp::Lt),
            "<=" => Some(FilterOp::Le),
            ">" => Some(FilterOp::Gt),
            ">=" => Some(FilterOp::Ge),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

/// What a query returns per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QueryMode {
    /// Full records.
    #[default]
    Full,
    /// Only the projected properties.
    Projected,
    /// Only keys; no properties, no decoded record.
    KeysOnly,
}

// ============================================================================
// CURSOR
// ============================================================================

/// Opaque query position, rendered as URL-safe base64 without padding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Vec<u8>);

impl Cursor {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse a cursor previously produced by `to_string`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("empty cursor".to_string());
        }
        URL_SAFE_NO_PAD
            .decode(raw)
            .map(Cursor)
            .map_err(|e| e.to_string())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(&self.0))
    }
}

// ============================================================================
// QUERY
// ============================================================================

/// Immutable query descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: String,
    ancestor: Option<Key>,
    filters: Vec<Filter>,
    orders: Vec<Order>,
    projection: Vec<String>,
    mode: QueryMode,
    distinct: bool,
    eventual: bool,
    limit: Option<usize>,
    offset: usize,
    start: Option<Cursor>,
    end: Option<Cursor>,
    err: Option<QueryError>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestor: None,
            filters: Vec::new(),
            orders: Vec::new(),
            projection: Vec::new(),
            mode: QueryMode::Full,
            distinct: false,
            eventual: false,
            limit: None,
            offset: 0,
            start: None,
            end: None,
            err: None,
        }
    }

    fn derive(&self, f: impl FnOnce(&mut Query)) -> Query {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    fn fail(&self, err: QueryError) -> Query {
        self.derive(|q| {
            if q.err.is_none() {
                q.err = Some(err);
            }
        })
    }

    /// Restrict results to descendants of `ancestor` (strongly consistent).
    pub fn ancestor(&self, ancestor: Key) -> Query {
        self.derive(|q| q.ancestor = Some(ancestor))
    }

    pub fn filter(&self, property: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Query {
        let filter = Filter {
            property: property.into(),
            op,
            value: value.into(),
        };
        self.derive(|q| q.filters.push(filter))
    }

    /// Add a filter written as `"<property> <op>"`, e.g. `"Name >="`.
    pub fn filter_str(&self, expr: &str, value: impl Into<Value>) -> Query {
        let mut parts = expr.split_whitespace();
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(property), Some(symbol), None) => {
                FilterOp::parse(symbol).map(|op| (property.to_string(), op))
            }
            (Some(property), None, None) => Some((property.to_string(), FilterOp::Eq)),
            _ => None,
        };
        match parsed {
            Some((property, op)) => self.filter(property, op, value),
            None => self.fail(QueryError::InvalidFilter {
                filter: expr.to_string(),
                reason: "expected \"<property> <op>\" with op one of = < <= > >=".to_string(),
            }),
        }
    }

    pub fn order_asc(&self, property: impl Into<String>) -> Query {
        let order = Order {
            property: property.into(),
            direction: Direction::Asc,
        };
        self.derive(|q| q.orders.push(order))
    }

    pub fn order_desc(&self, property: impl Into<String>) -> Query {
        let order = Order {
            property: property.into(),
            direction: Direction::Desc,
        };
        self.derive(|q| q.orders.push(order))
    }

    /// Return only the named properties.
    pub fn project<I, S>(&self, properties: I) -> Query
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projection: Vec<String> = properties.into_iter().map(Into::into).collect();
        self.derive(|q| {
            q.projection = projection;
            q.mode = QueryMode::Projected;
        })
    }

    /// Return keys only. Clears any projection.
    pub fn keys_only(&self) -> Query {
        self.derive(|q| {
            q.projection.clear();
            q.mode = QueryMode::KeysOnly;
        })
    }

    /// Drop duplicate projected rows.
    pub fn distinct(&self) -> Query {
        self.derive(|q| q.distinct = true)
    }

    pub fn eventual_consistency(&self) -> Query {
        self.derive(|q| q.eventual = true)
    }

    pub fn limit(&self, limit: usize) -> Query {
        self.derive(|q| q.limit = Some(limit))
    }

    pub fn offset(&self, offset: usize) -> Query {
        self.derive(|q| q.offset = offset)
    }

    pub fn start_cursor(&self, cursor: Cursor) -> Query {
        self.derive(|q| q.start = Some(cursor))
    }

    pub fn end_cursor(&self, cursor: Cursor) -> Query {
        self.derive(|q| q.end = Some(cursor))
    }

    /// Resume from a cursor string; a malformed string fails the query.
    pub fn start(&self, cursor: &str) -> Query {
        match Cursor::parse(cursor) {
            Ok(cursor) => self.start_cursor(cursor),
            Err(reason) => self.fail(QueryError::InvalidCursor {
                bound: CursorBound::Start,
                reason,
            }),
        }
    }

    /// Stop at a cursor string; a malformed string fails the query.
    pub fn end(&self, cursor: &str) -> Query {
        match Cursor::parse(cursor) {
            Ok(cursor) => self.end_cursor(cursor),
            Err(reason) => self.fail(QueryError::InvalidCursor {
                bound: CursorBound::End,
                reason,
            }),
        }
    }

    /// The same query with the mode replaced; used by hybrid execution.
    pub fn with_mode(&self, mode: QueryMode) -> Query {
        self.derive(|q| {
            q.mode = mode;
            if mode != QueryMode::Projected {
                q.projection.clear();
            }
        })
    }

    /// Report the first deferred construction error, then shape errors.
    pub fn validate(&self) -> Result<(), QueryError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.kind.is_empty() {
            return Err(QueryError::InvalidQuery {
                reason: "query has no kind".to_string(),
            });
        }
        if self.mode == QueryMode::Projected && self.projection.is_empty() {
            return Err(QueryError::InvalidQuery {
                reason: "projected query names no properties".to_string(),
            });
        }
        if self.distinct && self.mode != QueryMode::Projected {
            return Err(QueryError::InvalidQuery {
                reason: "distinct requires a projection".to_string(),
            });
        }
        Ok(())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ancestor_key(&self) -> Option<&Key> {
        self.ancestor.as_ref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn projection(&self) -> &[String] {
        &self.projection
    }

    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn is_eventual(&self) -> bool {
        self.eventual
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn row_offset(&self) -> usize {
        self.offset
    }

    pub fn start_at(&self) -> Option<&Cursor> {
        self.start.as_ref()
    }

    pub fn end_at(&self) -> Option<&Cursor> {
        self.end.as_ref()
    }
}
