//! Bounded LRU of minted leaf certificates, keyed by hostname or, for
//! wildcard leaves, the parent domain. Grounded on `rust_http_proxy`'s use
//! of `lru_time_cache::LruCache` for its own per-host cert cache.

use super::{Leaf, RootCa};
use crate::error::ProxyError;
use lru_time_cache::LruCache;
use std::sync::Mutex;
use std::time::Duration;

pub struct LeafCertCache {
    inner: Mutex<LruCache<String, Leaf>>,
    wildcard: bool,
    wildcard_use_parent: bool,
    lifetime: Duration,
}

impl LeafCertCache {
    pub fn new(capacity: usize, wildcard: bool, wildcard_use_parent: bool, lifetime: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::with_capacity(capacity)),
            wildcard,
            wildcard_use_parent,
            lifetime,
        }
    }

    /// Return the cached leaf for `hostname`'s cache key, minting and
    /// inserting one via `root_ca` on a miss.
    pub fn get_or_mint(&self, root_ca: &RootCa, hostname: &str) -> Result<Leaf, ProxyError> {
        let (_, cache_key) = super::effective_subject(hostname, self.wildcard, self.wildcard_use_parent);

        // Held across the whole get-or-insert: `mint_leaf` is synchronous, so
        // the lock hold time is dominated by minting either way, and holding
        // it through the miss prevents two concurrent requests for the same
        // never-before-seen hostname from both minting and inserting.
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ProxyError::setup("leaf cert cache lock poisoned"))?;

        if let Some(leaf) = guard.get(&cache_key) {
            return Ok(leaf.clone());
        }

        let leaf = root_ca.mint_leaf(hostname, self.wildcard, self.wildcard_use_parent, self.lifetime)?;
        guard.insert(leaf.cache_key.clone(), leaf.clone());
        Ok(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaFileCache;
    use std::sync::{Arc, Mutex};

    fn test_root_ca() -> RootCa {
        crate::io::tls::ensure_crypto_provider_installed();
        let sink = CaFileCache::Memory(Arc::new(Mutex::new(Vec::new())));
        RootCa::load_or_generate(&sink, "test-ca").unwrap()
    }

    #[test]
    fn wildcard_mode_mints_one_leaf_for_sibling_subdomains() {
        let root = test_root_ca();
        let cache = LeafCertCache::new(8, true, true, Duration::from_secs(60));

        let a = cache.get_or_mint(&root, "a.example.com").unwrap();
        let b = cache.get_or_mint(&root, "b.example.com").unwrap();

        assert_eq!(a.cache_key, "example.com");
        assert_eq!(b.cache_key, "example.com");
        assert!(Arc::ptr_eq(&a.certified_key, &b.certified_key));
    }

    #[test]
    fn distinct_parents_mint_distinct_leaves() {
        let root = test_root_ca();
        let cache = LeafCertCache::new(8, true, true, Duration::from_secs(60));

        let a = cache.get_or_mint(&root, "a.example.com").unwrap();
        let c = cache.get_or_mint(&root, "c.other.org").unwrap();

        assert_ne!(a.cache_key, c.cache_key);
        assert!(!Arc::ptr_eq(&a.certified_key, &c.certified_key));
    }
}
