//! Pool configuration that hosts can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Byte offset of the managed region inside the host buffer.
    pub region_start: usize,

    /// Length of the managed region. `None` means "up to the end of the buffer".
    pub region_size: Option<usize>,

    /// Attach an allocation registry so nested allocations can be re-parented
    /// and freed transitively.
    pub track_ownership: bool,

    /// Overwrite freed payloads with a marker byte (debug builds only).
    pub stomp_freed: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            region_start: 0,
            region_size: None,
            track_ownership: false,
            stomp_freed: true,
        }
    }
}

impl PoolConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `BYTEPOOL_REGION_START`: region start offset in bytes
    /// - `BYTEPOOL_REGION_SIZE`: region size in bytes
    /// - `BYTEPOOL_TRACK_OWNERSHIP`: `true`/`false`
    /// - `BYTEPOOL_STOMP_FREED`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("BYTEPOOL_REGION_START") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.region_start = v;
            }
        }

        if let Ok(s) = std::env::var("BYTEPOOL_REGION_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.region_size = Some(v);
            }
        }

        if let Ok(s) = std::env::var("BYTEPOOL_TRACK_OWNERSHIP") {
            if let Some(v) = parse_flag(&s) {
                cfg.track_ownership = v;
            }
        }

        if let Ok(s) = std::env::var("BYTEPOOL_STOMP_FREED") {
            if let Some(v) = parse_flag(&s) {
                cfg.stomp_freed = v;
            }
        }

        cfg
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.region_size == Some(0) {
            return Err(Error::Config("region_size must be greater than zero".into()));
        }
        if let Some(size) = self.region_size {
            if self.region_start.checked_add(size).is_none() {
                return Err(Error::Config(format!(
                    "region [{}, +{}) overflows the address space",
                    self.region_start, size
                )));
            }
        }
        Ok(())
    }

    /// Resolve the configured region against a concrete buffer length.
    /// Returns `(region_start, region_size)`.
    pub fn resolve_region(&self, buffer_len: usize) -> Result<(usize, usize)> {
        self.validate()?;
        if self.region_start > buffer_len {
            return Err(Error::Config(format!(
                "region_start {} lies beyond buffer of {} bytes",
                self.region_start, buffer_len
            )));
        }
        let size = self
            .region_size
            .unwrap_or(buffer_len - self.region_start);
        if self.region_start + size > buffer_len {
            return Err(Error::Config(format!(
                "region [{}, {}) exceeds buffer of {} bytes",
                self.region_start,
                self.region_start + size,
                buffer_len
            )));
        }
        Ok((self.region_start, size))
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
