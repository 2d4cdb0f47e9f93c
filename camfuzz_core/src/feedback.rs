use std::collections::HashSet;

/// A coverage signature: MD5 over the sorted, comma-joined coverage integers.
pub type CoverageHash = [u8; 16];

/// Order-insensitive hash of a coverage vector.
pub fn coverage_hash(coverage: &[i64]) -> CoverageHash {
    let mut sorted = coverage.to_vec();
    sorted.sort_unstable();
    let joined = sorted
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");
    md5::compute(joined.as_bytes()).0
}

/// Every coverage signature seen so far. Append-only.
#[derive(Default, Debug, Clone)]
pub struct CoverageMap {
    known_hashes: HashSet<CoverageHash>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the signature of `coverage`. Returns `true` if it was not seen before.
    pub fn observe(&mut self, coverage: &[i64]) -> bool {
        self.known_hashes.insert(coverage_hash(coverage))
    }

    pub fn contains(&self, coverage: &[i64]) -> bool {
        self.known_hashes.contains(&coverage_hash(coverage))
    }

    pub fn len(&self) -> usize {
        self.known_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_hashes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_hash_ignores_order() {
        assert_eq!(coverage_hash(&[3, 1, 2]), coverage_hash(&[1, 2, 3]));
        assert_ne!(coverage_hash(&[1, 2]), coverage_hash(&[12]));
    }

    #[test]
    fn coverage_map_reports_only_new_signatures() {
        let mut map = CoverageMap::new();
        assert!(map.is_empty());
        assert!(map.observe(&[1, 2, 3]));
        assert!(!map.observe(&[3, 2, 1]));
        assert!(map.contains(&[2, 1, 3]));
        assert!(map.observe(&[4]));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn coverage_map_never_shrinks() {
        let mut map = CoverageMap::new();
        let mut last = 0;
        for i in 0..50i64 {
            map.observe(&[i % 7, 100 + i % 3]);
            assert!(map.len() >= last);
            last = map.len();
        }
        assert_eq!(last, 21);
    }
}
