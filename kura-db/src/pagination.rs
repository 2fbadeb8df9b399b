use std::collections::HashMap;
use std::fmt;

use kura_schema::Schema;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("Schema has no property {0}")]
    UnknownKey(String),
    #[error("Unknown sort order {0}")]
    InvalidOrder(String),
    #[error("Invalid limit {0}")]
    InvalidLimit(String),
    #[error("Invalid offset {0}")]
    InvalidOffset(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Result<Self, PaginationError> {
        match s {
            "" | "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(PaginationError::InvalidOrder(other.to_string())),
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Sort key, order, limit and offset for list reads. `limit == 0` means
/// no limit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Paginator {
    pub key: String,
    pub order: SortOrder,
    pub limit: u64,
    pub offset: u64,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            key: "id".into(),
            order: SortOrder::Asc,
            limit: 0,
            offset: 0,
        }
    }
}

impl Paginator {
    pub fn new(schema: &Schema, key: &str, order: &str, limit: u64, offset: u64) -> Result<Self, PaginationError> {
        let key = if key.is_empty() { "id" } else { key };
        if !schema.has_property(key) {
            return Err(PaginationError::UnknownKey(key.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            order: SortOrder::parse(order)?,
            limit,
            offset,
        })
    }

    /// Reads `sort_key`, `sort_order`, `limit` and `offset`; the first value
    /// of each is used and empty strings fall back to defaults.
    pub fn from_query(schema: &Schema, query: &HashMap<String, Vec<String>>) -> Result<Self, PaginationError> {
        let first = |k: &str| query.get(k).and_then(|v| v.first()).map(String::as_str).unwrap_or("");
        let number = |k: &str, err: fn(String) -> PaginationError| -> Result<u64, PaginationError> {
            match first(k) {
                "" => Ok(0),
                raw => raw.parse::<u64>().map_err(|_| err(raw.to_string())),
            }
        };
        let limit = number("limit", PaginationError::InvalidLimit)?;
        let offset = number("offset", PaginationError::InvalidOffset)?;
        Self::new(schema, first("sort_key"), first("sort_order"), limit, offset)
    }

    pub fn is_paginated(&self) -> bool {
        self.limit > 0 || self.offset > 0
    }
}

impl fmt::Display for Paginator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{}:{}", self.key, self.order, self.limit, self.offset)
    }
}
