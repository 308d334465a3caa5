//! shardlru: sharded, namespaced LRU cache with charge-based capacity
//! accounting.
//!
//! Entries are opaque values keyed by byte strings. Each entry carries a
//! caller-assigned charge accounted against a fixed total budget; when a
//! shard runs over budget it evicts from the least recently used end of
//! its recency list. Entries can be pinned (referenced) to keep them
//! resident, merged atomically via caller-supplied operators, and given
//! deleters that fire exactly once on destruction.
//!
//! The keyspace is split across up to 1024 independently locked shards,
//! selected by the high bits of a 32-bit key hash, so operations on
//! unrelated keys proceed in parallel. Namespace handles prepend a fixed
//! 10-byte tag to every key, letting unrelated workloads share one cache
//! without collisions.
//!
//! ```
//! use shardlru::prelude::*;
//!
//! let cache = CacheBuilder::new(64 << 20).try_build().unwrap();
//! let (sessions, _) = cache.open_namespace("sessions");
//!
//! sessions.put("user:42", "token");
//! assert_eq!(sessions.get("user:42").as_deref(), Some("token"));
//!
//! let id = sessions.new_id("request-seq").unwrap();
//! assert_eq!(id, 1);
//! ```

pub mod builder;
pub mod cache;
pub mod ds;
pub mod error;
pub mod merge;
pub mod namespace;
pub mod prelude;
pub mod stats;

mod shard;
