use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Dimensionality of the face encodings produced by the detector.
pub const EMBEDDING_DIM: usize = 128;

/// Face box in pixels, ordered the way the detector reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bbox {
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
    pub left: u16,
}

impl Bbox {
    pub fn new(top: u16, right: u16, bottom: u16, left: u16) -> Self {
        Self { top, right, bottom, left }
    }

    /// Build from the detector's raw integers, rejecting negative or oversized values.
    pub fn from_raw(raw: [i64; 4]) -> Result<Self> {
        let mut out = [0u16; 4];
        for (slot, v) in out.iter_mut().zip(raw.iter()) {
            *slot = u16::try_from(*v).map_err(|_| anyhow::anyhow!("bbox coordinate {} out of range", v))?;
        }
        Ok(Self::new(out[0], out[1], out[2], out[3]))
    }

    pub fn width(&self) -> u32 {
        u32::from(self.right.saturating_sub(self.left))
    }

    pub fn height(&self) -> u32 {
        u32::from(self.bottom.saturating_sub(self.top))
    }
}

/// 128-dimensional face encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.len() != EMBEDDING_DIM {
            anyhow::bail!("face encoding must have {} values, got {}", EMBEDDING_DIM, values.len());
        }
        if values.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("face encoding contains non-finite values");
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Euclidean distance.
    pub fn distance(&self, other: &Embedding) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl TryFrom<Vec<f64>> for Embedding {
    type Error = anyhow::Error;

    fn try_from(values: Vec<f64>) -> Result<Self> {
        Embedding::new(values)
    }
}

impl From<Embedding> for Vec<f64> {
    fn from(e: Embedding) -> Self {
        e.0
    }
}

/// One face as reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub location: Bbox,
    pub encoding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_rejects_wrong_dimension() {
        assert!(Embedding::new(vec![0.0; 127]).is_err());
        assert!(Embedding::new(vec![f64::NAN; EMBEDDING_DIM]).is_err());
        assert!(Embedding::new(vec![0.0; EMBEDDING_DIM]).is_ok());
    }

    #[test]
    fn euclidean_distance() {
        let mut a = vec![0.0; EMBEDDING_DIM];
        let mut b = vec![0.0; EMBEDDING_DIM];
        a[0] = 3.0;
        b[1] = 4.0;
        let a = Embedding::new(a).unwrap();
        let b = Embedding::new(b).unwrap();
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn bbox_from_raw_rejects_negative() {
        assert!(Bbox::from_raw([-1, 10, 10, 0]).is_err());
        let b = Bbox::from_raw([5, 40, 50, 10]).unwrap();
        assert_eq!(b.width(), 30);
        assert_eq!(b.height(), 45);
    }
}
