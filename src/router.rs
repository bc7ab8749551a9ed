//! Deterministic backend selection by message-id hash.

/// Maps a message-id onto one of N backends.
///
/// The hash is the first 8 bytes of the MD5 digest of the message-id
/// (angle brackets included), folded little-endian into a `u64`, reduced
/// modulo the backend count. This is a deployed contract: backends keep
/// per-article dedup state keyed by which proxy instance feeds them, so
/// the mapping must be stable across restarts and match the sibling
/// implementations byte for byte. There is no rebalancing on failure; a
/// backend loss is fatal to the whole session.
#[derive(Debug, Clone, Copy)]
pub struct BackendSelector {
    backends: usize,
}

impl BackendSelector {
    pub fn new(backends: usize) -> Self {
        debug_assert!(backends > 0);
        Self { backends }
    }

    /// Pick the backend index for `msgid`. Pure: same message-id and same
    /// backend count always yield the same index.
    pub fn select(&self, msgid: &str) -> usize {
        (Self::hash(msgid) % self.backends as u64) as usize
    }

    /// MD5-derived 64-bit fold of `key`.
    fn hash(key: &str) -> u64 {
        let digest = md5::compute(key.as_bytes());
        let d = digest.0;
        u64::from_le_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_the_documented_md5_fold() {
        // Pinned vector: changing the hash silently reshuffles article
        // ownership across backends
        assert_eq!(BackendSelector::hash("<1@example>"), 9_355_785_406_279_806_727);
    }

    #[test]
    fn test_select_is_deterministic() {
        let selector = BackendSelector::new(7);
        let first = selector.select("<abc.123@news.example>");
        for _ in 0..100 {
            assert_eq!(selector.select("<abc.123@news.example>"), first);
        }
    }

    #[test]
    fn test_select_in_range() {
        for n in 1..=9 {
            let selector = BackendSelector::new(n);
            for i in 0..200 {
                let idx = selector.select(&format!("<{i}@host.example>"));
                assert!(idx < n);
            }
        }
    }

    #[test]
    fn test_select_single_backend() {
        let selector = BackendSelector::new(1);
        assert_eq!(selector.select("<anything@anywhere>"), 0);
    }

    #[test]
    fn test_known_two_backend_split() {
        // Used by the integration tests to craft cross-backend scenarios
        let selector = BackendSelector::new(2);
        assert_eq!(selector.select("<a@x>"), 0);
        assert_eq!(selector.select("<d@x>"), 1);
    }

    #[test]
    fn test_brackets_are_part_of_the_key() {
        assert_ne!(
            BackendSelector::hash("<1@example>"),
            BackendSelector::hash("1@example")
        );
    }

    #[test]
    fn test_spread_is_not_degenerate() {
        let selector = BackendSelector::new(4);
        let mut hits = [0usize; 4];
        for i in 0..400 {
            hits[selector.select(&format!("<{i}@spread.example>"))] += 1;
        }
        for (idx, &count) in hits.iter().enumerate() {
            assert!(count > 40, "backend {idx} starved: {hits:?}");
        }
    }
}
