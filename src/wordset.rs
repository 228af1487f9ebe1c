use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::game::WORDS_PER_GAME;

/// Content hash of a canonical word set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WordSetId([u8; 32]);

impl fmt::Display for WordSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("need at least 25 distinct words, got {0}")]
pub struct TooFewWords(pub usize);

/// Interns word pools so every game dealt from the same pool shares one allocation.
#[derive(Default)]
pub struct WordSets {
    by_id: Mutex<HashMap<WordSetId, Arc<[String]>>>,
}

impl WordSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trim, upper-case, dedupe and sort `words`, then return the shared copy
    /// of that pool. An empty input yields an empty pool; callers treat that
    /// as "use the default words".
    pub fn canonicalize<S: AsRef<str>>(&self, words: &[S]) -> Result<(WordSetId, Arc<[String]>), TooFewWords> {
        let set: BTreeSet<String> = words
            .iter()
            .map(|w| w.as_ref().trim().to_uppercase())
            .filter(|w| !w.is_empty())
            .collect();
        if !set.is_empty() && set.len() < WORDS_PER_GAME {
            return Err(TooFewWords(set.len()));
        }

        let mut hasher = Sha256::new();
        for w in &set {
            hasher.update(w.as_bytes());
            hasher.update([0u8]);
        }
        let id = WordSetId(hasher.finalize().into());

        let mut by_id = self.by_id.lock().unwrap_or_else(|e| e.into_inner());
        let interned = by_id
            .entry(id)
            .or_insert_with(|| set.into_iter().collect())
            .clone();
        Ok((id, interned))
    }

    pub fn len(&self) -> usize {
        self.by_id.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<String> {
        (0..n).map(|i| format!(" word{i} ")).collect()
    }

    #[test]
    fn test_canonical_form() {
        let sets = WordSets::new();
        let mut input = words(30);
        input.push("WORD3".to_string());
        input.push("   ".to_string());
        let (_, pool) = sets.canonicalize(&input).unwrap();
        assert_eq!(pool.len(), 30);
        assert!(pool.windows(2).all(|w| w[0] < w[1]));
        assert!(pool.iter().all(|w| w.starts_with("WORD")));
    }

    #[test]
    fn test_same_pool_is_shared() {
        let sets = WordSets::new();
        let (id_a, a) = sets.canonicalize(&words(40)).unwrap();
        let mut reversed = words(40);
        reversed.reverse();
        let (id_b, b) = sets.canonicalize(&reversed).unwrap();
        assert_eq!(id_a, id_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sets.len(), 1);
        assert_eq!(id_a.to_string().len(), 64);
    }

    #[test]
    fn test_rejects_small_pools() {
        let sets = WordSets::new();
        assert_eq!(sets.canonicalize(&words(24)), Err(TooFewWords(24)));
        let (_, empty) = sets.canonicalize::<String>(&[]).unwrap();
        assert!(empty.is_empty());
    }
}
