//! Stage 1: run the detector over every public photo of the album.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::detector::FaceDetector;
use super::{stage_single_face, PipelineContext, Transition};
use crate::db::query;
use crate::error::RecognitionResult;
use crate::models::{DetectedFace, Finished, Photo, Stage};
use crate::staging::AlbumState;

/// Faces of one photo. Unreadable photos and detector failures count as no
/// faces so the rest of the album still goes through.
pub fn detect_photo(detector: &dyn FaceDetector, photo: &Photo) -> Vec<DetectedFace> {
    let bytes = match photo.read_bytes() {
        Ok(b) => b,
        Err(e) => {
            warn!("photo {} ({:?}) unreadable, skipping: {}", photo.slug, photo.path, e);
            return Vec::new();
        }
    };
    match detector.detect(&bytes) {
        Ok(faces) => {
            debug!("photo {}: {} faces", photo.slug, faces.len());
            faces
        }
        Err(e) => {
            warn!("face detection failed for photo {}, skipping: {}", photo.slug, e);
            Vec::new()
        }
    }
}

pub fn run(ctx: &PipelineContext, album_id: i64) -> RecognitionResult<Transition> {
    let album = ctx.album(album_id)?;
    let photos: Vec<Photo> = ctx
        .read_db(|c| query::list_album_photos(c, album_id))?
        .into_iter()
        .filter(|p| !p.is_private)
        .collect();
    let state = ctx.album_state(album_id);
    for slug in state.photos()? {
        state.remove_photo(&slug)?;
    }

    let detector = ctx.detector.as_ref();
    let detected = photos
        .par_iter()
        .map(|photo| {
            let faces = detect_photo(detector, photo);
            state.incr_processed_photos()?;
            Ok(faces)
        })
        .collect::<RecognitionResult<Vec<_>>>()?;

    let mut total = 0usize;
    let mut last_slug = None;
    for (photo, faces) in photos.iter().zip(detected) {
        if faces.is_empty() {
            continue;
        }
        store_photo(&state, &photo.slug, &faces)?;
        total += faces.len();
        last_slug = Some(photo.slug.clone());
    }
    info!("album {}: {} faces found in {} photos", album_id, total, photos.len());

    match (total, last_slug) {
        (0, _) | (_, None) => Ok(Transition::Finish(Finished::NoFaces)),
        (1, Some(slug)) => {
            stage_single_face(&state, &slug)?;
            ctx.reconcile_or_commit(&album)
        }
        _ => Ok(Transition::Enter(Stage::VerifyFrames)),
    }
}

fn store_photo(state: &AlbumState<'_>, slug: &str, faces: &[DetectedFace]) -> RecognitionResult<()> {
    state.write_photo_faces(slug, faces)?;
    state.push_photo(slug)?;
    Ok(())
}
