pub use crate::builder::{default_cache, default_handle, init_default, CacheBuilder};
pub use crate::cache::Cache;
pub use crate::error::{ConfigError, OperatorError};
pub use crate::merge::{
    int64_charge, int64_merge, ChargeOperator, Deleter, MergeOperator, Value, INT64_CHARGE,
};
pub use crate::namespace::Namespace;
pub use crate::stats::CacheStats;
