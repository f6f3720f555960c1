//! Sparse word-list feature (BoVW inverted-index families). An
//! ordered-unique sequence of 32-bit word IDs: duplicates removed,
//! sorted strictly ascending.

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SparseFeature {
    words: Vec<u32>,
}

impl SparseFeature {
    /// Build from an arbitrary word sequence: sorts and dedups so the
    /// strictly-ascending invariant always holds by construction.
    pub fn from_words(mut words: Vec<u32>) -> SparseFeature {
        words.sort_unstable();
        words.dedup();
        SparseFeature { words }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Wire form: space-separated lowercase hex word IDs
    /// (e.g. `"1f 2a0 5cd e001"`).
    pub fn serialize(&self) -> String {
        self.words
            .iter()
            .map(|w| format!("{:x}", w))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn deserialize(s: &str) -> Result<SparseFeature> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(SparseFeature::default());
        }
        let mut words = Vec::new();
        for tok in trimmed.split_whitespace() {
            let w = u32::from_str_radix(tok, 16)
                .map_err(|err| err_at!(InvalidArguments, "bad hex word {:?}: {}", tok, err))?;
            words.push(w);
        }
        Ok(SparseFeature::from_words(words))
    }
}

#[cfg(test)]
mod sparse_test {
    use super::*;

    #[test]
    fn test_from_words_sorts_and_dedups() {
        let f = SparseFeature::from_words(vec![5, 1, 5, 3, 1]);
        assert_eq!(f.words(), &[1, 3, 5]);
    }

    #[test]
    fn test_serialize_deserialize_round_trip() {
        let f = SparseFeature::from_words(vec![0x1f, 0x2a0, 0x5cd, 0xe001]);
        let s = f.serialize();
        assert_eq!(s, "1f 2a0 5cd e001");
        let back = SparseFeature::deserialize(&s).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_empty_round_trip() {
        let f = SparseFeature::default();
        assert_eq!(f.serialize(), "");
        let back = SparseFeature::deserialize("").unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_deserialize_rejects_non_hex() {
        assert!(SparseFeature::deserialize("zz").is_err());
    }
}
