//! Module `feature` is the per-family specialization point: each family
//! supplies extraction, serialization, and similarity for one of the
//! three feature shapes (dense bit-vector, sparse word list, dense
//! float vector).
//!
//! The driver (`crate::driver`) is generic over `dyn Family` rather than
//! monomorphized per family type: with a dozen+ named families sharing
//! one driver/storage pairing pattern, a trait object registry keeps
//! one compiled `Driver` able to serve any family selected at runtime by
//! `driver.name`, built from a string→constructor registry initialized
//! at startup, without needing a generated copy of the driver per
//! family.

pub mod bitvec;
pub mod dense;
pub mod families;
pub mod sparse;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::variant::Variant;

pub use bitvec::{BitFeature, ColorFingerprint};
pub use dense::DenseFeature;
pub use sparse::SparseFeature;

/// A feature value in one of the three family shapes.
#[derive(Clone, Debug)]
pub enum FeatureValue {
    Bit(BitFeature),
    Sparse(SparseFeature),
    Dense(DenseFeature),
}

impl FeatureValue {
    pub fn as_bit(&self) -> Result<&BitFeature> {
        match self {
            FeatureValue::Bit(f) => Ok(f),
            _ => Err(err_at!(InvalidArguments, "feature is not a bit-vector")),
        }
    }

    pub fn as_sparse(&self) -> Result<&SparseFeature> {
        match self {
            FeatureValue::Sparse(f) => Ok(f),
            _ => Err(err_at!(InvalidArguments, "feature is not a sparse word list")),
        }
    }

    pub fn as_dense(&self) -> Result<&DenseFeature> {
        match self {
            FeatureValue::Dense(f) => Ok(f),
            _ => Err(err_at!(InvalidArguments, "feature is not a dense vector")),
        }
    }
}

/// External collaborator: the numerics library that turns decoded
/// pixels into keypoints, descriptors, and ultimately raw per-family
/// feature material. Explicitly out of scope for this crate, so the
/// only implementation shipped here is [`NullExtractor`], which always
/// reports [`Error::NotImplemented`]. A real embedding application
/// wires in its own extractor.
pub trait RawExtractor: Send + Sync {
    fn extract_image_bytes(&self, decoded_rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>>;
}

pub struct NullExtractor;

impl RawExtractor for NullExtractor {
    fn extract_image_bytes(&self, _decoded_rgb: &[u8], _width: u32, _height: u32) -> Result<Vec<u8>> {
        Err(err_at!(
            NotImplemented,
            "feature extraction requires an external numerics backend"
        ))
    }
}

/// Per-family specialization. Implementors own their wire format and
/// similarity function; the driver only ever calls through this trait,
/// never matches on a concrete family type.
pub trait Family: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract_image(&self, width: u32, height: u32, rgb: &[u8]) -> Result<FeatureValue> {
        let _ = (width, height, rgb);
        Err(err_at!(
            NotImplemented,
            "{}: extraction from decoded pixels requires an external numerics backend",
            self.name()
        ))
    }

    fn extract_data(&self, data: &[u8]) -> Result<FeatureValue> {
        let _ = data;
        Err(err_at!(
            NotImplemented,
            "{}: extraction from raw image bytes requires external image decoding",
            self.name()
        ))
    }

    fn extract_file(&self, path: &Path) -> Result<FeatureValue> {
        let _ = path;
        Err(err_at!(
            NotImplemented,
            "{}: extraction from a file path requires external image decoding",
            self.name()
        ))
    }

    fn serialize(&self, feature: &FeatureValue) -> Result<String>;
    fn deserialize(&self, s: &str) -> Result<FeatureValue>;
    fn similarity(&self, a: &FeatureValue, b: &FeatureValue) -> Result<f32>;

    /// `Some(words)` for sparse (inverted-index backed) families; the
    /// default is `None` for fixed-store families whose search is
    /// bit-cosine, not inverted-list based.
    fn word_list(&self, feature: &FeatureValue) -> Option<Vec<u32>> {
        let _ = feature;
        None
    }

    /// Per-word weight function injected before searches/writes.
    /// Identity by default; `Driver::set_weighting` overrides it (e.g.
    /// with IDF, updated through the `update_idf`/`print_idf`
    /// control-channel calls) for families that support it.
    fn weight(&self, word: u32) -> f32 {
        let _ = word;
        1.0
    }

    /// Whether this family's storage is the flat mmap store (bit-vector
    /// and dense families) or the inverted index (sparse families).
    fn is_sparse(&self) -> bool {
        false
    }

    /// Fixed-width byte budget the flat store should allocate per
    /// vector slot for this family, strictly larger than the longest
    /// serialized form this family ever produces. `0` for sparse
    /// families, which never use the flat store.
    fn fixed_record_len(&self) -> usize {
        0
    }
}

pub type Constructor = fn(&Variant) -> Result<Box<dyn Family>>;

fn registry() -> &'static Lazy<HashMap<&'static str, Constructor>> {
    static REGISTRY: Lazy<HashMap<&'static str, Constructor>> = Lazy::new(|| {
        let mut m: HashMap<&'static str, Constructor> = HashMap::new();
        m.insert("bovw2k", families::Bovw2k::construct);
        m.insert("bovw8k", families::Bovw8k::construct);
        m.insert("bovw512k", families::Bovw512k::construct);
        m.insert("bovw2k_boc", families::Bovw2kBoc::construct);
        m.insert("bovw8k_boc", families::Bovw8kBoc::construct);
        m.insert("bovw512k_boc", families::Bovw512kBoc::construct);
        m.insert("bovw512k_iv", families::Bovw512kIv::construct);
        m.insert("sboc", families::Sboc::construct);
        m.insert("vlad128", families::Vlad128::construct);
        m.insert("vlad512", families::Vlad512::construct);
        m.insert("lmca_vlad", families::LmcaVlad::construct);
        m.insert("lmca_hsv", families::LmcaHsv::construct);
        m.insert("lmca_vladhsv", families::LmcaVladHsv::construct);
        m.insert("lmca_vlad_hsv", families::LmcaVladHsvSplit::construct);
        m.insert("lmca_vlad_colorcode", families::LmcaVladColorcode::construct);
        m
    });
    &REGISTRY
}

/// Construct the family named by `driver.name` in `config`, looked up
/// in a string→constructor registry initialized at startup.
pub fn construct(name: &str, config: &Variant) -> Result<Box<dyn Family>> {
    match registry().get(name) {
        Some(ctor) => ctor(config),
        None => Err(err_at!(InvalidArguments, "unknown driver.name {:?}", name)),
    }
}

pub fn known_family_names() -> Vec<&'static str> {
    registry().keys().copied().collect()
}
