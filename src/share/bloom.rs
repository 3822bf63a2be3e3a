//! Trigram bloom filter for fast negative search answers.
//!
//! Every shared file name feeds its lowercase 3-byte windows into the filter.
//! An incoming text search first checks that each term's trigrams are all
//! possibly present; a miss proves no file name can contain the term, so the
//! full tree walk is skipped. False positives only cost the walk.

use std::hash::{DefaultHasher, Hash, Hasher};

const NUM_HASHES: u64 = 2;

/// Fixed-size bloom filter over name trigrams
#[derive(Clone, Debug)]
pub struct SearchBloom {
    bits: Vec<u64>,
    mask: u64,
}

impl SearchBloom {
    /// Create a filter with roughly `capacity` expected names
    pub fn new(capacity: usize) -> Self {
        // ~16 bits per expected trigram, rounded up to a power of two words
        let bits = (capacity.max(1024) * 16).next_power_of_two();
        Self {
            bits: vec![0u64; bits / 64],
            mask: bits as u64 - 1,
        }
    }

    fn positions(gram: &[u8]) -> [u64; NUM_HASHES as usize] {
        let mut h1 = DefaultHasher::new();
        gram.hash(&mut h1);
        let a = h1.finish();
        let mut h2 = DefaultHasher::new();
        (gram, 0x9e3779b9u64).hash(&mut h2);
        let b = h2.finish() | 1;
        [a, a.wrapping_add(b)]
    }

    fn set(&mut self, pos: u64) {
        let bit = pos & self.mask;
        self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    fn get(&self, pos: u64) -> bool {
        let bit = pos & self.mask;
        self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Feed a file or directory name into the filter
    pub fn add_name(&mut self, name: &str) {
        let lower = name.to_lowercase();
        let bytes = lower.as_bytes();
        if bytes.len() < 3 {
            return;
        }
        for gram in bytes.windows(3) {
            for pos in Self::positions(gram) {
                self.set(pos);
            }
        }
    }

    /// True when a name containing `term` may exist.
    ///
    /// Terms shorter than one trigram cannot be filtered and always pass.
    pub fn maybe_contains(&self, term: &str) -> bool {
        let lower = term.to_lowercase();
        let bytes = lower.as_bytes();
        if bytes.len() < 3 {
            return true;
        }
        bytes
            .windows(3)
            .all(|gram| Self::positions(gram).iter().all(|&p| self.get(p)))
    }

    /// True when every term may match
    pub fn maybe_contains_all<'a>(&self, terms: impl IntoIterator<Item = &'a str>) -> bool {
        terms.into_iter().all(|t| self.maybe_contains(t))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_names_always_pass_their_own_substrings() {
        let mut bloom = SearchBloom::new(16);
        bloom.add_name("Some.Release.2024.1080p-GRP");

        for term in ["release", "2024", "1080p", "GRP", "some.release"] {
            assert!(bloom.maybe_contains(term), "{term} is a real substring");
        }
    }

    #[test]
    fn unrelated_terms_are_rejected() {
        let mut bloom = SearchBloom::new(16);
        bloom.add_name("Some.Release.2024.1080p-GRP");

        // With a near-empty filter these must miss.
        assert!(!bloom.maybe_contains("zzqqxxjjww"));
        assert!(!bloom.maybe_contains("documentary"));
    }

    #[test]
    fn short_terms_always_pass() {
        let bloom = SearchBloom::new(16);
        assert!(bloom.maybe_contains("ab"));
        assert!(bloom.maybe_contains(""));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut bloom = SearchBloom::new(16);
        bloom.add_name("MiXeD.CaSe.NaMe");
        assert!(bloom.maybe_contains("mixed.case"));
        assert!(bloom.maybe_contains("NAME"));
    }

    #[test]
    fn contains_all_requires_every_term() {
        let mut bloom = SearchBloom::new(16);
        bloom.add_name("alpha.beta.gamma");
        assert!(bloom.maybe_contains_all(["alpha", "gamma"]));
        assert!(!bloom.maybe_contains_all(["alpha", "zzqqxxjjww"]));
    }
}
