//! String intern pool: hands out one canonical, pointer-equal handle per distinct
//! channel name.
//!
//! An ownership-disciplined language naturally reaches for immutable shared strings
//! with reference counts instead of a manual `get`/`release` API — that's exactly what
//! `Rc<str>` already is, so `Canonical` wraps one and the pool tracks only `Weak`
//! handles: once every `Canonical` clone for a given string is dropped, the entry is
//! already logically dead and is swept away the next time that bucket is touched.

use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use twox_hash::XxHash64;

/// Fixed bucket count; acceptable for moderate channel cardinalities.
const BUCKET_COUNT: usize = 2063;

/// A canonical, pointer-equal string handle returned by [`Pool::get`].
#[derive(Clone)]
pub struct Canonical(Rc<str>);

impl Canonical {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for Canonical {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Canonical {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Canonical {}

impl Hash for Canonical {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl std::fmt::Debug for Canonical {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Canonical({:?})", self.0)
    }
}

fn bucket_index(s: &str) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    s.as_bytes().hash(&mut hasher);
    (hasher.finish() % BUCKET_COUNT as u64) as usize
}

/// Bucketed table of `{bytes, refcount}` nodes, refcount delegated to `Rc`.
pub struct Pool {
    buckets: Vec<Vec<(Box<str>, Weak<str>)>>,
}

impl Pool {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Vec::new);
        Self { buckets }
    }

    /// Return the canonical handle for `s`, creating it if no live handle exists.
    pub fn get(&mut self, s: &str) -> Canonical {
        let idx = bucket_index(s);
        let bucket = &mut self.buckets[idx];
        bucket.retain(|(_, weak)| weak.strong_count() > 0);
        if let Some((_, weak)) = bucket.iter().find(|(key, _)| key.as_ref() == s) {
            if let Some(rc) = weak.upgrade() {
                return Canonical(rc);
            }
        }
        let rc: Rc<str> = Rc::from(s);
        bucket.push((s.into(), Rc::downgrade(&rc)));
        Canonical(rc)
    }

    /// Number of live entries across all buckets. Exposed for tests only.
    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_get_returns_the_same_pointer_while_held() {
        let mut pool = Pool::new();
        let a = pool.get("channel-x");
        let b = pool.get("channel-x");
        assert!(Rc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn dropping_all_handles_frees_the_slot() {
        let mut pool = Pool::new();
        {
            let _a = pool.get("ephemeral");
            assert_eq!(pool.live_count(), 1);
        }
        // last Rc dropped; the bucket slot is now dead but still present until swept
        let a2 = pool.get("ephemeral");
        assert_eq!(Rc::strong_count(&a2.0), 1);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn distinct_strings_get_distinct_pointers() {
        let mut pool = Pool::new();
        let a = pool.get("x");
        let b = pool.get("y");
        assert!(!Rc::ptr_eq(&a.0, &b.0));
    }
}
