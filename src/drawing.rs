//! Drawings: the templates WorkOrders are cut from.
//!
//! A Drawing pairs a factory script with an optional fixed part query. When
//! the query is present, orders run against exactly those parts and may not
//! supply their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrderError, OrderErrorCode};
use crate::script;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drawing {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Fixed part query; when set, orders may not override it
    pub part_query: Option<String>,
    pub script: String,
    pub created_at: DateTime<Utc>,
}

impl Drawing {
    /// Reject scripts that do not compile, before they become templates.
    pub fn validate_script(name: &str, script_source: &str) -> Result<(), OrderError> {
        match script::lint(script_source) {
            None => Ok(()),
            Some(err) => Err(OrderError::new(
                OrderErrorCode::ScriptInvalid,
                format!("drawing '{}': {}", name, err),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_script_passes() {
        assert!(Drawing::validate_script("burn-in", "x = 1\nmessage( msg=\"ok\" )").is_ok());
    }

    #[test]
    fn broken_script_is_coded() {
        let err = Drawing::validate_script("burn-in", "goto nowhere").unwrap_err();
        assert_eq!(err.code, OrderErrorCode::ScriptInvalid);
        assert!(err.message.contains("burn-in"));
    }
}
