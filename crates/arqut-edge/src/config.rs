//! Environment configuration.
//!
//! `.env.local` and `.env` are loaded first (both optional), then the
//! process environment wins.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique edge identifier; generated when `EDGE_ID` is absent.
    pub edge_id: String,
    pub api_key: String,
    /// Local API bind address, `SERVER_ADDR`, default `:3030`.
    pub server_addr: SocketAddr,
    pub db_path: String,
    /// Cloud base URL; without it the agent runs cloud-less.
    pub cloud_url: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::dotenv();

        let api_key = match std::env::var("ARQUT_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("ARQUT_API_KEY environment variable is required"),
        };

        let edge_id = env_or("EDGE_ID", "");
        let edge_id = if edge_id.is_empty() {
            arqut_store::ids::edge_id()
        } else {
            edge_id
        };

        let server_addr = parse_bind_addr(&env_or("SERVER_ADDR", ":3030"))?;
        let cloud_url = std::env::var("ARQUT_CLOUD_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Ok(Self {
            edge_id,
            api_key,
            server_addr,
            db_path: env_or("DB_PATH", "./data/edge.db"),
            cloud_url,
            log_level: env_or("ARQUT_LOG_LEVEL", "info"),
        })
    }

    /// First 8 characters of the API key, for log lines.
    pub fn masked_api_key(&self) -> String {
        if self.api_key.len() <= 8 {
            "***".to_string()
        } else {
            format!("{}***", &self.api_key[..8])
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Accepts `:3030` (all interfaces) as well as a full `host:port`.
fn parse_bind_addr(raw: &str) -> Result<SocketAddr> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .with_context(|| format!("invalid SERVER_ADDR: {raw}"))
}
