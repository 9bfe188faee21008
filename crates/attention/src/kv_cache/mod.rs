//! Key/value cache management for incremental decoding.
//!
//! Each decoder layer owns one [`KvCacheEntry`]. Beam search never copies the
//! stored history on reorder; it records the parent row of every new position
//! and resolves the per-row history lazily in [`KeyValueCache::materialize`].

pub mod api;
pub mod entry;
pub mod layout;

pub use api::KeyValueCache;
pub use entry::KvCacheEntry;
pub use layout::CacheLayout;

#[cfg(test)]
mod tests;
