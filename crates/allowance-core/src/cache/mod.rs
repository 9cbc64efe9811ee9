//! In-memory, session-scoped caching.
//!
//! Entries are timestamped and valid only while `now - timestamp < ttl`.
//! Storage and capacity eviction are delegated to `mini-moka`; validity is
//! decided from the entry timestamp so paused-clock tests stay exact.

mod entry;

pub use entry::{CacheEntry, TtlCache};
