//! Binary layout of staged face data: bbox as four little-endian u16
//! (top, right, bottom, left), encoding as 128 little-endian f64.

use crate::models::{Bbox, Embedding, EMBEDDING_DIM};

pub const BBOX_LEN: usize = 8;
pub const EMBEDDING_LEN: usize = EMBEDDING_DIM * 8;

pub fn encode_bbox(b: &Bbox) -> [u8; BBOX_LEN] {
    let mut out = [0u8; BBOX_LEN];
    for (i, v) in [b.top, b.right, b.bottom, b.left].iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_bbox(blob: &[u8]) -> Result<Bbox, String> {
    if blob.len() != BBOX_LEN {
        return Err(format!("bbox blob must be {} bytes, got {}", BBOX_LEN, blob.len()));
    }
    let v = |i: usize| u16::from_le_bytes([blob[i * 2], blob[i * 2 + 1]]);
    Ok(Bbox::new(v(0), v(1), v(2), v(3)))
}

pub fn encode_embedding(e: &Embedding) -> Vec<u8> {
    e.as_slice().iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(blob: &[u8]) -> Result<Embedding, String> {
    if blob.len() != EMBEDDING_LEN {
        return Err(format!("encoding blob must be {} bytes, got {}", EMBEDDING_LEN, blob.len()));
    }
    let values = blob
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    Embedding::new(values).map_err(|e| e.to_string())
}
