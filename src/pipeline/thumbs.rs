use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, warn};

use crate::models::Bbox;
use crate::utils::path;

fn ensure_dir(p: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(p)
}

/// Crop `bbox` out of `img`, clamped to the image bounds.
pub fn crop_face(img: &DynamicImage, bbox: &Bbox) -> Option<DynamicImage> {
    let (w, h) = (img.width(), img.height());
    let left = u32::from(bbox.left).min(w);
    let top = u32::from(bbox.top).min(h);
    let right = u32::from(bbox.right).min(w);
    let bottom = u32::from(bbox.bottom).min(h);
    if right <= left || bottom <= top {
        return None;
    }
    Some(img.crop_imm(left, top, right - left, bottom - top))
}

pub fn write_face_thumb(img: &DynamicImage, bbox: &Bbox, dst: &Path) -> Result<()> {
    let face = crop_face(img, bbox).ok_or_else(|| anyhow::anyhow!("empty face box {:?}", bbox))?;
    if let Some(dir) = dst.parent() {
        ensure_dir(dir)?;
    }
    let rgb = face.to_rgb8();
    let file = File::create(dst).with_context(|| format!("Failed to create thumbnail {:?}", dst))?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), 85);
    let write_result = encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)
        .with_context(|| format!("Failed to encode thumbnail {:?}", dst));

    if let Err(e) = write_result {
        if dst.exists() {
            if let Err(rm_err) = std::fs::remove_file(dst) {
                warn!("Failed to clean up partial thumbnail file {:?} after write error: {}", dst, rm_err);
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Render `<temp>/album_<A>/patterns/<p>/<f>.jpg` for every (pattern, face,
/// box) taken from one photo. Failures are logged; thumbnails are only a
/// review aid.
pub fn render_photo_faces(temp_root: &Path, album_id: i64, image_bytes: &[u8], faces: &[(usize, usize, Bbox)]) {
    let img = match image::load_from_memory(image_bytes) {
        Ok(img) => img,
        Err(e) => {
            warn!("album {}: cannot decode photo for thumbnails: {}", album_id, e);
            return;
        }
    };
    for (pattern, face, bbox) in faces {
        let dst = path::face_thumb_path(temp_root, album_id, *pattern, *face);
        if let Err(e) = write_face_thumb(&img, bbox, &dst) {
            warn!("album {}: thumbnail {:?} not written: {}", album_id, dst, e);
        }
    }
}

/// Apply ((old pattern, old face) -> (new pattern, new face)) renames.
/// Files go through a holding directory first so swaps never collide.
pub fn relocate(temp_root: &Path, album_id: i64, moves: &[((usize, usize), (usize, usize))]) -> Result<()> {
    let holding = path::album_temp_dir(temp_root, album_id).join("patterns").join("_moving");
    ensure_dir(&holding)?;
    let mut parked = Vec::with_capacity(moves.len());
    for (i, ((op, of), dst)) in moves.iter().enumerate() {
        let src = path::face_thumb_path(temp_root, album_id, *op, *of);
        if !src.exists() {
            debug!("album {}: no thumbnail at {:?}", album_id, src);
            continue;
        }
        let tmp = holding.join(format!("{}.jpg", i));
        std::fs::rename(&src, &tmp).with_context(|| format!("Failed to move {:?}", src))?;
        parked.push((tmp, *dst));
    }
    for (tmp, (np, nf)) in parked {
        let dst = path::face_thumb_path(temp_root, album_id, np, nf);
        if let Some(dir) = dst.parent() {
            ensure_dir(dir)?;
        }
        std::fs::rename(&tmp, &dst).with_context(|| format!("Failed to move thumbnail to {:?}", dst))?;
    }
    let _ = std::fs::remove_dir(&holding);
    Ok(())
}

pub fn remove_album_dir(temp_root: &Path, album_id: i64) -> Result<()> {
    let dir = path::album_temp_dir(temp_root, album_id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", dir)),
    }
}
