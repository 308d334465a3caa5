//! Error types for the shardlru library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache configuration parameters are invalid
//!   (e.g. out-of-range shard bits) or the process-default instance is used
//!   incorrectly (double initialization, use before initialization).
//! - [`OperatorError`]: Returned when a caller-supplied merge or charge
//!   operator rejects its inputs. A failed operator aborts the merge with no
//!   state change.
//!
//! ## Example Usage
//!
//! ```
//! use shardlru::builder::CacheBuilder;
//! use shardlru::error::ConfigError;
//! use shardlru::cache::Cache;
//!
//! // Fallible constructor for user-configurable parameters
//! let cache: Result<Cache, ConfigError> = CacheBuilder::new(1 << 20).shard_bits(4).try_build();
//! assert!(cache.is_ok());
//!
//! // Out-of-range shard bits are caught without panicking
//! let bad = CacheBuilder::new(1 << 20).shard_bits(12).try_build();
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::try_build`](crate::builder::CacheBuilder::try_build)
/// and the process-default facade ([`init_default`](crate::builder::init_default),
/// [`default_cache`](crate::builder::default_cache)). Carries a human-readable
/// description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// OperatorError
// ---------------------------------------------------------------------------

/// Error returned when a merge or charge operator rejects its inputs.
///
/// Produced by the built-in i64 operators when a stored value is not an
/// `i64`, and by any caller-supplied operator that fails. A merge that
/// receives an operator error leaves the entry untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorError(String);

impl OperatorError {
    /// Creates a new `OperatorError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Creates an `OperatorError` describing a value of the wrong type.
    #[inline]
    pub fn type_mismatch(expected: &str) -> Self {
        Self(format!("type mismatch: expected {expected} value"))
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for OperatorError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- ConfigError ------------------------------------------------------

    #[test]
    fn config_display_shows_message() {
        let err = ConfigError::new("shard bits out of range");
        assert_eq!(err.to_string(), "shard bits out of range");
    }

    #[test]
    fn config_debug_includes_message() {
        let err = ConfigError::new("bad capacity");
        let dbg = format!("{:?}", err);
        assert!(dbg.contains("bad capacity"));
    }

    #[test]
    fn config_message_accessor() {
        let err = ConfigError::new("test");
        assert_eq!(err.message(), "test");
    }

    #[test]
    fn config_clone_and_eq() {
        let a = ConfigError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn config_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<ConfigError>();
    }

    // -- OperatorError ----------------------------------------------------

    #[test]
    fn operator_display_shows_message() {
        let err = OperatorError::new("overflow");
        assert_eq!(err.to_string(), "overflow");
    }

    #[test]
    fn operator_type_mismatch_names_expected_type() {
        let err = OperatorError::type_mismatch("i64");
        assert!(err.to_string().contains("i64"));
        assert!(err.to_string().contains("type mismatch"));
    }

    #[test]
    fn operator_clone_and_eq() {
        let a = OperatorError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn operator_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<OperatorError>();
    }
}
