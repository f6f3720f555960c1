//! Dense real-vector feature (VLAD/LMCA families): an L2-normalized
//! float array of fixed dimension, with an optional per-family color
//! sidecar (also L2-normalized, compared by plain cosine).

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Debug)]
pub struct DenseFeature {
    values: Vec<f32>,
    color: Option<Vec<f32>>,
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na = l2_norm(a);
    let nb = l2_norm(b);
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

impl DenseFeature {
    /// Construct from a raw (not-yet-normalized) vector; normalizes to
    /// unit L2 norm.
    pub fn new(raw: Vec<f32>, color: Option<Vec<f32>>) -> DenseFeature {
        DenseFeature {
            values: l2_normalize(raw),
            color: color.map(l2_normalize),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty_feature(&self) -> bool {
        self.values.iter().all(|&x| x == 0.0)
    }

    /// Plain cosine on the already-unit-normalized vectors, optionally
    /// blended with the color sidecar the same way the bit-vector
    /// family blends its color term: every family that carries a color
    /// sidecar mixes it in with the same additive weighting.
    pub fn similarity(&self, other: &DenseFeature, color_weight: f32) -> f32 {
        let base = cosine(&self.values, &other.values);
        match (&self.color, &other.color) {
            (Some(a), Some(b)) if color_weight > 0.0 => {
                let colorsim = cosine(a, b);
                (1.0 - color_weight) * base + color_weight * colorsim
            }
            _ => base,
        }
    }

    /// Wire form: space-separated `%E` floats, optionally followed by
    /// the color sidecar's floats.
    pub fn serialize(&self) -> String {
        let mut parts: Vec<String> = self.values.iter().map(format_e).collect();
        if let Some(color) = &self.color {
            parts.extend(color.iter().map(format_e));
        }
        parts.join(" ")
    }

    pub fn deserialize(s: &str, dim: usize, color_dim: Option<usize>) -> Result<DenseFeature> {
        let tokens: Vec<&str> = s.trim().split_whitespace().collect();
        let want = dim + color_dim.unwrap_or(0);
        if tokens.len() != want {
            return Err(err_at!(
                InvalidArguments,
                "dense feature token count {} != {}",
                tokens.len(),
                want
            ));
        }
        let mut values = Vec::with_capacity(dim);
        for tok in &tokens[..dim] {
            values.push(parse_float(tok)?);
        }
        let color = match color_dim {
            Some(cd) => {
                let mut c = Vec::with_capacity(cd);
                for tok in &tokens[dim..dim + cd] {
                    c.push(parse_float(tok)?);
                }
                Some(c)
            }
            None => None,
        };
        // values/color are already unit-normalized on the wire (this is
        // the deterministic serialization of an already-normalized
        // feature); re-running normalize here is a no-op up to float
        // error and keeps the invariant airtight against hand-edited
        // fixtures.
        Ok(DenseFeature {
            values: l2_normalize(values),
            color: color.map(l2_normalize),
        })
    }
}

fn format_e(v: &f32) -> String {
    format!("{:E}", v)
}

fn parse_float(tok: &str) -> Result<f32> {
    tok.parse::<f32>()
        .map_err(|err| err_at!(InvalidArguments, "bad float {:?}: {}", tok, err))
}

#[cfg(test)]
mod dense_test {
    use super::*;

    #[test]
    fn test_new_normalizes_to_unit_length() {
        let f = DenseFeature::new(vec![3.0, 4.0], None);
        assert!((l2_norm(f.values()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_self_similarity_is_one() {
        let f = DenseFeature::new(vec![1.0, 2.0, -3.0, 0.5], None);
        let sim = f.similarity(&f, 0.0);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_orthogonal_vectors_have_zero_similarity() {
        let a = DenseFeature::new(vec![1.0, 0.0], None);
        let b = DenseFeature::new(vec![0.0, 1.0], None);
        assert!(a.similarity(&b, 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_serialize_deserialize_round_trip() {
        let f = DenseFeature::new(vec![1.0, -2.0, 3.0], Some(vec![0.5, 0.5]));
        let s = f.serialize();
        let back = DenseFeature::deserialize(&s, 3, Some(2)).unwrap();
        for (a, b) in f.values().iter().zip(back.values().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_empty_feature_is_zero_vector() {
        let f = DenseFeature::new(vec![0.0, 0.0, 0.0], None);
        assert!(f.is_empty_feature());
    }
}
