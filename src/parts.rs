//! Part inventory access.
//!
//! The engine never talks to the structure store directly; it goes through
//! [`PartClient`] with a bounded fetch, so order creation can detect an
//! oversized match without pulling the whole inventory.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::value::ScriptValue;

/// A part record as the inventory exposes it. `values` become the `part.*`
/// bindings of the job's runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    pub values: HashMap<String, ScriptValue>,
}

#[async_trait]
pub trait PartClient: Send + Sync {
    /// Fetch at most `limit` parts matching `query`.
    async fn find_parts(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Part>>;
}

/// In-memory inventory. Matching is deliberately simple: `*` matches
/// everything, anything else matches parts whose name contains it.
#[derive(Default)]
pub struct MemoryPartClient {
    parts: RwLock<Vec<Part>>,
}

impl MemoryPartClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_part(&self, part: Part) {
        self.parts.write().await.push(part);
    }
}

#[async_trait]
impl PartClient for MemoryPartClient {
    async fn find_parts(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Part>> {
        let parts = self.parts.read().await;
        Ok(parts
            .iter()
            .filter(|part| query == "*" || part.name.contains(query))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str) -> Part {
        let mut values = HashMap::new();
        values.insert(
            "hostname".to_string(),
            ScriptValue::Str(format!("{}.factory", name)),
        );
        Part {
            name: name.to_string(),
            values,
        }
    }

    #[tokio::test]
    async fn fetch_is_bounded() {
        let client = MemoryPartClient::new();
        for i in 0..5 {
            client.add_part(part(&format!("unit-{}", i))).await;
        }
        assert_eq!(client.find_parts("*", 3).await.unwrap().len(), 3);
        assert_eq!(client.find_parts("unit-4", 10).await.unwrap().len(), 1);
        assert!(client.find_parts("gear", 10).await.unwrap().is_empty());
    }
}
