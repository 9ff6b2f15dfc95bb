use std::hash::{Hash, Hasher};

pub(crate) fn hash<H: Hash>(x: &H) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    x.hash(&mut hasher);
    hasher.finish()
}

/// Slot index for a fixed-size cache of `slots` entries.
pub(crate) fn cache_slot<H: Hash>(x: &H, slots: usize) -> usize {
    (hash(x) % slots as u64) as usize
}
