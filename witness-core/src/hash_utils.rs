//! Module for hashing utilities.
//!
//! Named hash_utils to prevent clashing with the std::hash module.

/// HashMap using a fast, non-cryptographic hash algorithm.
pub type FastHashMap<K, V> =
    std::collections::HashMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
/// HashSet using a fast, non-cryptographic hash algorithm.
pub type FastHashSet<K> =
    std::collections::HashSet<K, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Create an empty [`FastHashMap`] with room for `capacity` entries.
///
/// Tables in this crate are sized once, from the pool capacities, so that
/// steady-state operation does not grow them.
pub fn map_with_capacity<K, V>(capacity: usize) -> FastHashMap<K, V> {
    FastHashMap::with_capacity_and_hasher(capacity, Default::default())
}

/// Create an empty [`FastHashSet`] with room for `capacity` entries.
pub fn set_with_capacity<K>(capacity: usize) -> FastHashSet<K> {
    FastHashSet::with_capacity_and_hasher(capacity, Default::default())
}
