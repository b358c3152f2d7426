//! Hostname index with wildcard suffixes and a resolution cache.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

/// Maps hostnames to values. Exact names are stored as-is; names of the form
/// `*.suffix` are stored with the suffix reversed so that suffix matching
/// becomes prefix matching on the reversed request hostname.
///
/// Lookups cache their outcome (including definitive misses) under the
/// original hostname, so repeated requests for the same name skip the
/// wildcard probe. The cache is bounded implicitly by the set of hostnames
/// actually seen; entries die with the map on config reload.
#[derive(Debug)]
pub struct HostMap<T: Clone> {
    exact: HashMap<String, T>,
    // reversed wildcard suffix -> value, e.g. "*.example.com" => "moc.elpmaxe"
    wildcard: Vec<(String, T)>,
    cache: RwLock<HashMap<String, Option<T>>>,
}

impl<T: Clone> Default for HostMap<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: Vec::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> HostMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// Register a hostname. Returns `false` when the name (exact or
    /// wildcard) is already bound.
    pub fn insert(&mut self, host_name: &str, value: T) -> bool {
        let name = host_name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return false;
        }
        if let Some(suffix) = name.strip_prefix('*') {
            let key: String = suffix.trim_start_matches('.').chars().rev().collect();
            if self.wildcard.iter().any(|(k, _)| *k == key) {
                return false;
            }
            // Longest suffix first, so the first prefix hit is the winner.
            let at = self
                .wildcard
                .iter()
                .position(|(k, _)| k.len() < key.len())
                .unwrap_or(self.wildcard.len());
            self.wildcard.insert(at, (key, value));
            true
        } else {
            self.exact.insert(name, value).is_none()
        }
    }

    /// Resolve a hostname: exact match first, then the longest wildcard
    /// suffix on a dot boundary. `*.example.com` matches `a.example.com`
    /// and `b.a.example.com` but neither `example.com` nor
    /// `notexample.com`.
    pub fn lookup(&self, host_name: &str) -> Option<T> {
        let name = host_name.trim().to_ascii_lowercase();

        if let Some(found) = self.exact.get(&name) {
            return Some(found.clone());
        }

        if let Some(cached) = self.cache.read().unwrap_or_else(|e| e.into_inner()).get(&name) {
            return cached.clone();
        }

        // Miss: probe wildcards under the exclusive lock, re-checking the
        // cache in case another thread resolved the same name first.
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&name) {
            return cached.clone();
        }

        let resolved = self.probe_wildcards(&name);
        debug!(
            host = %name,
            matched = resolved.is_some(),
            "Cached wildcard resolution"
        );
        cache.insert(name, resolved.clone());
        resolved
    }

    fn probe_wildcards(&self, name: &str) -> Option<T> {
        let reversed: String = name.chars().rev().collect();
        for (key, value) in &self.wildcard {
            if reversed.len() > key.len()
                && reversed.starts_with(key.as_str())
                && reversed.as_bytes()[key.len()] == b'.'
            {
                return Some(value.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::HostMap;

    fn map() -> HostMap<&'static str> {
        let mut map = HostMap::new();
        assert!(map.insert("svc.local", "exact"));
        assert!(map.insert("*.example.com", "wild"));
        assert!(map.insert("*.a.example.com", "deep"));
        map
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let mut map = map();
        assert!(map.insert("www.example.com", "www"));
        assert_eq!(map.lookup("www.example.com"), Some("www"));
        assert_eq!(map.lookup("svc.local"), Some("exact"));
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let map = map();
        assert_eq!(map.lookup("a.example.com"), Some("wild"));
        assert_eq!(map.lookup("x.y.example.com"), Some("wild"));
        assert_eq!(map.lookup("example.com"), None);
        assert_eq!(map.lookup("notexample.com"), None);
    }

    #[test]
    fn longest_wildcard_suffix_wins() {
        let map = map();
        assert_eq!(map.lookup("b.a.example.com"), Some("deep"));
        assert_eq!(map.lookup("b.c.example.com"), Some("wild"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let map = map();
        assert_eq!(map.lookup("SVC.LOCAL"), Some("exact"));
        assert_eq!(map.lookup("A.Example.COM"), Some("wild"));
    }

    #[test]
    fn negative_results_are_cached() {
        let map = map();
        assert_eq!(map.lookup("unknown.host"), None);
        // Second lookup hits the cache; same answer.
        assert_eq!(map.lookup("unknown.host"), None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut map = map();
        assert!(!map.insert("svc.local", "dup"));
        assert!(!map.insert("*.example.com", "dup"));
        assert!(!map.insert("  ", "dup"));
    }
}
