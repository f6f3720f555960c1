//! Dense bit-vector feature with optional color sidecar (BoVW families,
//! fixed-store backed). Grounded on `otama_fixed_driver.hpp` /
//! `otama_bovw_fixed_driver.hpp` and the color pyramid in
//! `nv_color_boc.h`.

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Spatial-pyramid levels carried by a color fingerprint.
pub const COLOR_LEVELS: usize = 4;
/// Per-level weight schedule applied when combining pyramid levels into
/// one color similarity score.
pub const COLOR_LEVEL_WEIGHTS: [f32; COLOR_LEVELS] = [0.4, 0.25, 0.15, 0.2];

/// A fixed-length packed bit array, 64 bits per backing word.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BitArray {
    words: Vec<u64>,
    n_bits: usize,
}

impl BitArray {
    pub fn zeros(n_bits: usize) -> BitArray {
        BitArray {
            words: vec![0u64; (n_bits + 63) / 64],
            n_bits,
        }
    }

    pub fn from_words(words: Vec<u64>, n_bits: usize) -> BitArray {
        debug_assert_eq!(words.len(), (n_bits + 63) / 64);
        BitArray { words, n_bits }
    }

    pub fn n_bits(&self) -> usize {
        self.n_bits
    }

    pub fn set(&mut self, i: usize, v: bool) {
        debug_assert!(i < self.n_bits);
        let word = i / 64;
        let bit = i % 64;
        if v {
            self.words[word] |= 1u64 << bit;
        } else {
            self.words[word] &= !(1u64 << bit);
        }
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.n_bits);
        (self.words[i / 64] >> (i % 64)) & 1 == 1
    }

    /// Population count across the whole array.
    pub fn popcount(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// `popcount(self AND other)`.
    pub fn and_popcount(&self, other: &BitArray) -> u32 {
        debug_assert_eq!(self.n_bits, other.n_bits);
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a & b).count_ones())
            .sum()
    }

    /// `sqrt(popcount(self))`, or `f32::MAX` for the empty (all-zero)
    /// feature so that dividing by it yields similarity 0.
    pub fn norm(&self) -> f32 {
        let pc = self.popcount();
        if pc == 0 {
            f32::MAX
        } else {
            (pc as f32).sqrt()
        }
    }

    /// Indices of every set bit, ascending. Used by the IDF rerank pass,
    /// which treats a bit-vector as a sparse word list.
    pub fn set_indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (w, word) in self.words.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let b = bits.trailing_zeros();
                out.push((w * 64 + b as usize) as u32);
                bits &= bits - 1;
            }
        }
        out
    }

    pub fn n_words(&self) -> usize {
        self.words.len()
    }

    fn to_hex(&self) -> String {
        let mut s = String::with_capacity(self.words.len() * 16);
        for w in &self.words {
            let _ = write!(s, "{:016x}", w);
        }
        s
    }

    fn from_hex(hex: &str, n_bits: usize) -> Result<BitArray> {
        let n_words = (n_bits + 63) / 64;
        if hex.len() != n_words * 16 {
            return Err(err_at!(
                InvalidArguments,
                "bit block hex length {} != {}",
                hex.len(),
                n_words * 16
            ));
        }
        let mut words = Vec::with_capacity(n_words);
        for i in 0..n_words {
            let chunk = &hex[i * 16..i * 16 + 16];
            let w = u64::from_str_radix(chunk, 16)
                .map_err(|err| err_at!(InvalidArguments, "bad hex word {:?}: {}", chunk, err))?;
            words.push(w);
        }
        Ok(BitArray::from_words(words, n_bits))
    }
}

/// Thermometer-encode a quantized value `v` in `1..=4` into the 4-bit
/// mask `2^v - 1`. `v == 0` (no signal in this bin) yields an all-zero
/// nibble.
pub fn thermometer_mask(v: u8) -> u8 {
    debug_assert!(v <= 4);
    if v == 0 {
        0
    } else {
        (1u8 << v) - 1
    }
}

/// A color fingerprint: one bit-bucket histogram per spatial pyramid
/// level, each with its own bit array and (thus) its own norm.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ColorFingerprint {
    levels: [BitArray; COLOR_LEVELS],
}

impl ColorFingerprint {
    pub fn new(levels: [BitArray; COLOR_LEVELS]) -> ColorFingerprint {
        ColorFingerprint { levels }
    }

    pub fn empty(n_bits_per_level: usize) -> ColorFingerprint {
        ColorFingerprint {
            levels: std::array::from_fn(|_| BitArray::zeros(n_bits_per_level)),
        }
    }

    pub fn level(&self, i: usize) -> &BitArray {
        &self.levels[i]
    }

    /// Weighted sum over pyramid levels of
    /// `popcount(a.level AND b.level) / (norm_a.level * norm_b.level)`.
    pub fn similarity(&self, other: &ColorFingerprint) -> f32 {
        let mut sim = 0.0f32;
        for level in 0..COLOR_LEVELS {
            let a = &self.levels[level];
            let b = &other.levels[level];
            let overlap = a.and_popcount(b) as f32;
            let denom = a.norm() * b.norm();
            sim += COLOR_LEVEL_WEIGHTS[level] * (overlap / denom);
        }
        sim
    }

    fn to_hex(&self) -> String {
        self.levels.iter().map(|l| l.to_hex()).collect()
    }

    fn from_hex(hex: &str, n_bits_per_level: usize) -> Result<ColorFingerprint> {
        let n_words = (n_bits_per_level + 63) / 64;
        let chars_per_level = n_words * 16;
        if hex.len() != chars_per_level * COLOR_LEVELS {
            return Err(err_at!(
                InvalidArguments,
                "color block hex length {} != {}",
                hex.len(),
                chars_per_level * COLOR_LEVELS
            ));
        }
        let mut levels: Vec<BitArray> = Vec::with_capacity(COLOR_LEVELS);
        for i in 0..COLOR_LEVELS {
            let chunk = &hex[i * chars_per_level..(i + 1) * chars_per_level];
            levels.push(BitArray::from_hex(chunk, n_bits_per_level)?);
        }
        Ok(ColorFingerprint {
            levels: levels.try_into().unwrap(),
        })
    }

    fn n_bits_per_level(&self) -> usize {
        self.levels[0].n_bits()
    }
}

/// The dense bit-vector feature shared by the `bovw{2k,8k,512k}`
/// families, with an optional color sidecar.
#[derive(Clone, PartialEq, Debug)]
pub struct BitFeature {
    pub bits: BitArray,
    pub norm: f32,
    pub color: Option<ColorFingerprint>,
}

impl BitFeature {
    pub fn new(bits: BitArray, color: Option<ColorFingerprint>) -> BitFeature {
        let norm = bits.norm();
        BitFeature { bits, norm, color }
    }

    /// `popcount(a AND b) / (norm_a * norm_b)`, optionally blended with
    /// the color sidecar as `(1-cw)*bitcos + cw*colorsim`.
    pub fn similarity(&self, other: &BitFeature, color_weight: f32) -> f32 {
        let overlap = self.bits.and_popcount(&other.bits) as f32;
        let bitcos = overlap / (self.norm * other.norm);
        match (&self.color, &other.color) {
            (Some(a), Some(b)) if color_weight > 0.0 => {
                let colorsim = a.similarity(b);
                (1.0 - color_weight) * bitcos + color_weight * colorsim
            }
            _ => bitcos,
        }
    }

    /// Wire form: `<hex-of-bits>_<hex-of-color>`, exactly
    /// `(INT_BLOCKS*16 + 1 + COLOR_BLOCKS*16)` characters.
    pub fn serialize(&self) -> String {
        let bits_hex = self.bits.to_hex();
        let color_hex = self.color.as_ref().map(|c| c.to_hex()).unwrap_or_default();
        format!("{}_{}", bits_hex, color_hex)
    }

    pub fn deserialize(s: &str, n_bits: usize, color_bits_per_level: Option<usize>) -> Result<BitFeature> {
        let mut parts = s.splitn(2, '_');
        let bits_hex = parts
            .next()
            .ok_or_else(|| err_at!(InvalidArguments, "missing bit block in {:?}", s))?;
        let color_hex = parts.next().unwrap_or("");
        let bits = BitArray::from_hex(bits_hex, n_bits)?;
        let color = match (color_hex.is_empty(), color_bits_per_level) {
            (true, _) => None,
            (false, Some(n)) => Some(ColorFingerprint::from_hex(color_hex, n)?),
            (false, None) => {
                return Err(err_at!(
                    InvalidArguments,
                    "color block present but family has no color sidecar"
                ))
            }
        };
        Ok(BitFeature::new(bits, color))
    }

    pub fn is_empty_feature(&self) -> bool {
        self.bits.popcount() == 0
    }
}

#[cfg(test)]
mod bitvec_test {
    use super::*;

    fn feature_from_indices(n_bits: usize, indices: &[usize]) -> BitFeature {
        let mut bits = BitArray::zeros(n_bits);
        for &i in indices {
            bits.set(i, true);
        }
        BitFeature::new(bits, None)
    }

    #[test]
    fn test_self_similarity_is_one() {
        let f = feature_from_indices(2048, &[1, 5, 100, 2000]);
        let sim = f.similarity(&f, 0.0);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_feature_has_max_norm_and_zero_similarity_to_self() {
        let f = feature_from_indices(2048, &[]);
        assert_eq!(f.norm, f32::MAX);
        assert!(f.is_empty_feature());
        let sim = f.similarity(&f, 0.0);
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn test_disjoint_features_have_zero_similarity() {
        let a = feature_from_indices(2048, &[0, 1, 2]);
        let b = feature_from_indices(2048, &[1000, 1001, 1002]);
        assert_eq!(a.similarity(&b, 0.0), 0.0);
    }

    #[test]
    fn test_serialize_round_trip_no_color() {
        let f = feature_from_indices(2048, &[3, 17, 900]);
        let s = f.serialize();
        assert_eq!(s.len(), (2048 / 64) * 16 + 1);
        let back = BitFeature::deserialize(&s, 2048, None).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_serialize_round_trip_with_color() {
        let mut color_levels: [BitArray; COLOR_LEVELS] = std::array::from_fn(|_| BitArray::zeros(64));
        color_levels[0].set(3, true);
        let color = ColorFingerprint::new(color_levels);
        let mut bits = BitArray::zeros(128);
        bits.set(10, true);
        let f = BitFeature::new(bits, Some(color));
        let s = f.serialize();
        let expected_len = (128 / 64) * 16 + 1 + (64 / 64) * 16 * COLOR_LEVELS;
        assert_eq!(s.len(), expected_len);
        let back = BitFeature::deserialize(&s, 128, Some(64)).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_thermometer_mask() {
        assert_eq!(thermometer_mask(0), 0b0000);
        assert_eq!(thermometer_mask(1), 0b0001);
        assert_eq!(thermometer_mask(2), 0b0011);
        assert_eq!(thermometer_mask(3), 0b0111);
        assert_eq!(thermometer_mask(4), 0b1111);
    }

    #[test]
    fn test_color_weighting_blends_toward_color_on_bit_mismatch() {
        let mut bits_a = BitArray::zeros(64);
        bits_a.set(0, true);
        let mut bits_b = BitArray::zeros(64);
        bits_b.set(32, true); // disjoint main bits -> bitcos == 0

        let mut color_a_levels: [BitArray; COLOR_LEVELS] = std::array::from_fn(|_| BitArray::zeros(64));
        let mut color_b_levels: [BitArray; COLOR_LEVELS] = std::array::from_fn(|_| BitArray::zeros(64));
        for lvl in 0..COLOR_LEVELS {
            color_a_levels[lvl].set(5, true);
            color_b_levels[lvl].set(5, true); // identical color -> colorsim == 1
        }
        let a = BitFeature::new(bits_a, Some(ColorFingerprint::new(color_a_levels)));
        let b = BitFeature::new(bits_b, Some(ColorFingerprint::new(color_b_levels)));

        let no_color = a.similarity(&b, 0.0);
        let with_color = a.similarity(&b, 1.0);
        assert_eq!(no_color, 0.0);
        assert!((with_color - 1.0).abs() < 1e-5);
    }
}
