//! Value, deleter, and merge/charge operator types.
//!
//! The cache stores opaque payloads: any `Send + Sync` type behind an
//! `Arc<dyn Any>`. Merge and charge operators are plain function pointers
//! so that a merge is a pure computation the shard can run while holding
//! its lock, in the same way a weight function parameterizes a
//! weight-limited store.
//!
//! The built-in i64 operators back the counter surface
//! ([`Namespace::new_id`](crate::namespace::Namespace::new_id)).

use std::any::Any;
use std::sync::Arc;

use crate::error::OperatorError;

/// Opaque cache payload. Cloned cheaply via `Arc` on every hit.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Callback run exactly once when an entry is destroyed, with the full
/// (namespace-prefixed) key and the stored value.
///
/// Deleters never run under a shard lock: destruction is deferred until
/// the lock is released. A deleter must not call back into the shard that
/// owned the entry. The closure cannot return an error; a panicking
/// deleter propagates on the thread that caused the destruction.
pub type Deleter = Box<dyn FnOnce(&[u8], Value) + Send>;

/// Combines an existing value with a delta during an atomic merge.
///
/// Must be pure: it runs under the shard lock. A returned error aborts
/// the merge with no state change. An absent key never reaches the
/// operator; the delta is stored directly.
pub type MergeOperator = fn(&Value, &Value) -> Result<Value, OperatorError>;

/// Computes the post-merge charge from the existing charge and the charge
/// delta supplied to the merge. Same purity rules as [`MergeOperator`].
pub type ChargeOperator = fn(u64, u64) -> Result<u64, OperatorError>;

/// Fixed storage cost of an i64 counter entry.
pub const INT64_CHARGE: u64 = std::mem::size_of::<i64>() as u64;

/// Merge operator for i64 counters: `old + delta`, wrapping.
///
/// Fails with an [`OperatorError`] when either value is not an `i64`,
/// which also covers the case of a counter key colliding with an entry of
/// a different type.
pub fn int64_merge(old: &Value, delta: &Value) -> Result<Value, OperatorError> {
    let old = downcast_i64(old)?;
    let delta = downcast_i64(delta)?;
    Ok(Arc::new(old.wrapping_add(delta)))
}

/// Charge operator for i64 counters: a fixed [`INT64_CHARGE`] regardless
/// of how many increments the counter has absorbed.
pub fn int64_charge(_current: u64, _delta: u64) -> Result<u64, OperatorError> {
    Ok(INT64_CHARGE)
}

fn downcast_i64(value: &Value) -> Result<i64, OperatorError> {
    value
        .downcast_ref::<i64>()
        .copied()
        .ok_or_else(|| OperatorError::type_mismatch("i64"))
}
