//! Queries on a single file.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{Result, StoreError},
    model::change::validate_path,
};

/// A query on a file at one revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type")]
pub enum Query {
    /// Retrieves the content as it is stored.
    Identity { path: String },
    /// Retrieves the content rendered as text.
    Text { path: String },
    /// Retrieves the content parsed as JSON.
    Json { path: String },
    /// Applies a series of JSON path expressions to JSON content.
    JsonPath { path: String, expressions: Vec<String> },
}

impl Query {
    /// Returns a query that retrieves the content as it is.
    pub fn identity(path: &str) -> Result<Query> {
        validate_path(path)?;
        Ok(Query::Identity {
            path: path.to_string(),
        })
    }

    /// Returns a query that retrieves the textual content.
    pub fn of_text(path: &str) -> Result<Query> {
        validate_path(path)?;
        Ok(Query::Text {
            path: path.to_string(),
        })
    }

    /// Returns a query that retrieves the JSON content.
    pub fn of_json(path: &str) -> Result<Query> {
        validate_path(path)?;
        Ok(Query::Json {
            path: path.to_string(),
        })
    }

    /// Returns a query that applies JSON path expressions to the content.
    /// The path must name a `.json` file.
    pub fn of_json_path(path: &str, expressions: Vec<String>) -> Result<Query> {
        validate_path(path)?;
        if !path.ends_with(".json") {
            return Err(StoreError::InvalidArgument(format!(
                "JSON path queries require a .json file: {path}"
            )));
        }
        if expressions.is_empty() {
            return Err(StoreError::InvalidArgument(
                "JSON path query requires at least one expression".to_string(),
            ));
        }
        Ok(Query::JsonPath {
            path: path.to_string(),
            expressions,
        })
    }

    /// The queried file path.
    pub fn path(&self) -> &str {
        match self {
            Query::Identity { path }
            | Query::Text { path }
            | Query::Json { path }
            | Query::JsonPath { path, .. } => path,
        }
    }

    /// Stable textual form, used as part of computation cache keys.
    pub(crate) fn cache_key(&self) -> String {
        match self {
            Query::Identity { path } => format!("identity:{path}"),
            Query::Text { path } => format!("text:{path}"),
            Query::Json { path } => format!("json:{path}"),
            Query::JsonPath { path, expressions } => {
                format!("jsonpath:{path}:{}", expressions.join("\u{0}"))
            }
        }
    }
}
