//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `FABRICATOR_DATABASE_URL`: PostgreSQL connection string (optional; the
//!   in-memory store is used when unset)
//! - `FABRICATOR_HTTP_ADDR`: gateway bind address (default: 127.0.0.1:24250)
//! - `FABRICATOR_MAX_JOBS_DEFAULT`: default tasks per assembler pull when the
//!   request omits `max_jobs` (default: 10)

use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{Context, Result};

/// Default address for the gateway server
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:24250";

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; in-memory store when absent
    pub database_url: Option<String>,

    /// Gateway bind address
    pub http_addr: SocketAddr,

    /// Default tasks per assembler pull
    pub max_jobs_default: usize,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("FABRICATOR_DATABASE_URL").ok();

        let http_addr =
            env::var("FABRICATOR_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
        let http_addr =
            SocketAddr::from_str(&http_addr).context("invalid FABRICATOR_HTTP_ADDR format")?;

        let max_jobs_default = env::var("FABRICATOR_MAX_JOBS_DEFAULT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_url,
            http_addr,
            max_jobs_default,
        })
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database_url: None,
            http_addr: "127.0.0.1:0".parse().unwrap(),
            max_jobs_default: 10,
        }
    }
}
