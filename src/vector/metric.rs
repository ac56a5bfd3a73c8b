//! Distance metrics supported by the forest.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::types::VectorError;

/// Distance function used by a facet index. Smaller is more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Chord distance between unit vectors: `sqrt(2 - 2 cos)`.
    #[default]
    #[serde(alias = "cosine")]
    Angular,
    Euclidean,
    Manhattan,
}

impl Metric {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Metric::Angular => "angular",
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
        }
    }

    /// Stable tag written into index files.
    pub(crate) const fn tag(&self) -> u8 {
        match self {
            Metric::Angular => 0,
            Metric::Euclidean => 1,
            Metric::Manhattan => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::Angular),
            1 => Some(Metric::Euclidean),
            2 => Some(Metric::Manhattan),
            _ => None,
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Angular => {
                let cos = cosine_similarity(a, b);
                (2.0 - 2.0 * cos).max(0.0).sqrt()
            }
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Metric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "angular" | "cosine" => Ok(Metric::Angular),
            "euclidean" => Ok(Metric::Euclidean),
            "manhattan" => Ok(Metric::Manhattan),
            other => Err(VectorError::UnknownMetric(other.to_string())),
        }
    }
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity in `[-1, 1]`. Zero vectors are orthogonal to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    (dot(a, b) / denom).clamp(-1.0, 1.0)
}

/// Returns `v / |v|`, or a copy of `v` when it has no length.
pub(crate) fn normalized(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angular_distance_range() {
        let m = Metric::Angular;
        assert!(m.distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((m.distance(&[1.0, 0.0], &[0.0, 1.0]) - 2f32.sqrt()).abs() < 1e-6);
        assert!((m.distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_angular_orders_by_direction() {
        let m = Metric::Angular;
        let q = [1.0, 0.0];
        assert!(m.distance(&q, &[0.9, 0.1]) < m.distance(&q, &[0.0, 1.0]));
        assert!(m.distance(&q, &[1.0, 0.0]) < m.distance(&q, &[0.9, 0.1]));
    }

    #[test]
    fn test_euclidean_and_manhattan() {
        assert!((Metric::Euclidean.distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert!((Metric::Manhattan.distance(&[0.0, 0.0], &[3.0, -4.0]) - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_metric() {
        assert_eq!("cosine".parse::<Metric>().unwrap(), Metric::Angular);
        assert_eq!("Euclidean".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert!("hamming".parse::<Metric>().is_err());
        for metric in [Metric::Angular, Metric::Euclidean, Metric::Manhattan] {
            assert_eq!(Metric::from_tag(metric.tag()), Some(metric));
        }
    }

    #[test]
    fn test_zero_vector_similarity() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(normalized(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
