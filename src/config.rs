//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{bail, Context, Result};

/// Default inbound WebSocket message cap in bytes.
const DEFAULT_MAX_MESSAGE_BYTES: usize = 262_144;

/// The four event kinds the credential subsystem runs on. All must be
/// distinct and inside the parameterized-replaceable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMap {
    pub schema: u32,
    pub grant: u32,
    pub revoke: u32,
    pub renew: u32,
}

impl Default for KindMap {
    fn default() -> Self {
        Self {
            schema: 30300,
            grant: 30301,
            revoke: 30302,
            renew: 30303,
        }
    }
}

impl KindMap {
    fn check(&self) -> Result<()> {
        let all = [self.schema, self.grant, self.revoke, self.renew];
        for k in all {
            if !(30000..40000).contains(&k) {
                bail!("kind {} outside the parameterized-replaceable range", k);
            }
        }
        for i in 0..all.len() {
            for j in (i + 1)..all.len() {
                if all[i] == all[j] {
                    bail!("credential kinds must be distinct, {} repeats", all[i]);
                }
            }
        }
        Ok(())
    }
}

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the SQLite database file.
    pub store_path: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Configured credential event kinds.
    pub kinds: KindMap,
    /// Inbound WebSocket message cap in bytes.
    pub max_message_bytes: usize,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_path = PathBuf::from(env::var("STORE_PATH")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) == "1";
        let defaults = KindMap::default();
        let kinds = KindMap {
            schema: env_kind("KIND_SCHEMA", defaults.schema)?,
            grant: env_kind("KIND_GRANT", defaults.grant)?,
            revoke: env_kind("KIND_REVOKE", defaults.revoke)?,
            renew: env_kind("KIND_RENEW", defaults.renew)?,
        };
        kinds.check()?;
        let max_message_bytes = match env::var("MAX_MESSAGE_BYTES") {
            Ok(v) => v.parse().context("MAX_MESSAGE_BYTES")?,
            Err(_) => DEFAULT_MAX_MESSAGE_BYTES,
        };
        Ok(Self {
            store_path,
            bind_http,
            bind_ws,
            verify_sig,
            kinds,
            max_message_bytes,
        })
    }
}

fn env_kind(name: &str, default: u32) -> Result<u32> {
    match env::var(name) {
        Ok(v) => v.parse().with_context(|| name.to_string()),
        Err(_) => Ok(default),
    }
}

/// Serializes tests that touch process environment variables.
#[cfg(test)]
pub static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
