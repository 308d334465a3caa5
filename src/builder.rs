//! Cache construction and the process-default instance.
//!
//! [`CacheBuilder`] validates configuration and sizes the shard array:
//! shard bits must stay below 10, and a zero value derives them from
//! capacity so that every shard gets at least 512 KiB, capped at 64
//! shards.
//!
//! For call-sites that want singleton ergonomics, [`init_default`] /
//! [`default_cache`] hold one process-wide instance behind a `OnceLock`.
//! The core stays free of hidden state: a [`Cache`] is an explicit value
//! and the facade is a thin convenience on top.
//!
//! ## Example
//!
//! ```
//! use shardlru::builder::CacheBuilder;
//!
//! // Explicit instance, shard count derived from capacity.
//! let cache = CacheBuilder::new(8 << 20).try_build().unwrap();
//! assert!(cache.shard_count().is_power_of_two());
//! ```

use std::sync::OnceLock;

use crate::cache::Cache;
use crate::error::ConfigError;
use crate::namespace::Namespace;

/// Exclusive upper bound for configurable shard bits.
const MAX_SHARD_BITS: u32 = 10;

/// Derived shard counts keep every shard at least this large.
const MIN_SHARD_SIZE: u64 = 512 * 1024;

/// Derived shard bits never exceed this.
const MAX_DERIVED_SHARD_BITS: u32 = 6;

/// Builder for [`Cache`] instances.
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    capacity: u64,
    shard_bits: u32,
}

impl CacheBuilder {
    /// Starts a builder for a cache with the given total capacity, in
    /// charge units. Shard bits default to 0, meaning derived from
    /// capacity.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            shard_bits: 0,
        }
    }

    /// Requests `1 << bits` shards. Must be below 10; 0 derives the
    /// count from capacity.
    pub fn shard_bits(mut self, bits: u32) -> Self {
        self.shard_bits = bits;
        self
    }

    /// Validates the configuration and builds the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `shard_bits >= 10`.
    pub fn try_build(self) -> Result<Cache, ConfigError> {
        if self.shard_bits >= MAX_SHARD_BITS {
            return Err(ConfigError::new(format!(
                "num_shard_bits must be less than {MAX_SHARD_BITS}, got {}",
                self.shard_bits
            )));
        }
        let bits = if self.shard_bits == 0 {
            derive_shard_bits(self.capacity)
        } else {
            self.shard_bits
        };
        Ok(Cache::with_shards(self.capacity, bits))
    }
}

/// Derives shard bits so each shard holds at least [`MIN_SHARD_SIZE`],
/// capped at [`MAX_DERIVED_SHARD_BITS`].
fn derive_shard_bits(capacity: u64) -> u32 {
    let mut bits = 0;
    let mut shards = capacity / MIN_SHARD_SIZE;
    while shards != 0 {
        shards >>= 1;
        bits += 1;
        if bits >= MAX_DERIVED_SHARD_BITS {
            return MAX_DERIVED_SHARD_BITS;
        }
    }
    bits
}

static DEFAULT_CACHE: OnceLock<Cache> = OnceLock::new();

/// Initializes the process-default cache. One-shot: a second call fails.
///
/// `shard_bits` follows builder rules: 0 derives from capacity, values
/// of 10 and above are rejected.
///
/// # Errors
///
/// Returns [`ConfigError`] on invalid configuration or when the default
/// instance is already initialized.
pub fn init_default(capacity: u64, shard_bits: u32) -> Result<(), ConfigError> {
    let cache = CacheBuilder::new(capacity).shard_bits(shard_bits).try_build()?;
    DEFAULT_CACHE
        .set(cache)
        .map_err(|_| ConfigError::new("default cache is already initialized"))
}

/// Returns the process-default cache.
///
/// # Errors
///
/// Returns [`ConfigError`] when [`init_default`] has not run.
pub fn default_cache() -> Result<&'static Cache, ConfigError> {
    DEFAULT_CACHE
        .get()
        .ok_or_else(|| ConfigError::new("default cache is not initialized; call init_default first"))
}

/// Returns the unnamed handle of the process-default cache.
///
/// # Errors
///
/// Returns [`ConfigError`] when [`init_default`] has not run.
pub fn default_handle() -> Result<Namespace, ConfigError> {
    Ok(default_cache()?.default_handle())
}
