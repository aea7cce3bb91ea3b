//! Stage 2: drop the boxes the user unticked.

use serde_json::Value;
use tracing::info;

use super::{stage_single_face, verify, PipelineContext, Transition};
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::{DetectedFace, Finished, Stage};

pub fn apply(ctx: &PipelineContext, album_id: i64, payload: &Value) -> RecognitionResult<Transition> {
    let state = ctx.album_state(album_id);
    let slugs = state.photos()?;
    if slugs.is_empty() {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let mut photos = Vec::with_capacity(slugs.len());
    for slug in slugs {
        let amount = state.faces_amount(&slug)?;
        photos.push((slug, amount));
    }
    let removals = verify::frames(payload, &photos)?;

    let mut total = 0usize;
    let mut last_slug = None;
    for (slug, amount) in &photos {
        let kept = match removals.get(slug) {
            Some(marked) if !marked.is_empty() => {
                let kept: Vec<DetectedFace> = state
                    .photo_faces(slug)?
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !marked.contains(&(i + 1)))
                    .map(|(_, f)| f)
                    .collect();
                if kept.is_empty() {
                    state.remove_photo(slug)?;
                    continue;
                }
                state.write_photo_faces(slug, &kept)?;
                kept.len()
            }
            _ => *amount,
        };
        total += kept;
        last_slug = Some(slug.clone());
    }
    info!("album {}: {} faces kept after review", album_id, total);

    match (total, last_slug) {
        (0, _) | (_, None) => Ok(Transition::Finish(Finished::NoFaces)),
        (1, Some(slug)) => {
            stage_single_face(&state, &slug)?;
            let album = ctx.album(album_id)?;
            ctx.reconcile_or_commit(&album)
        }
        _ => Ok(Transition::Enter(Stage::BuildPatterns)),
    }
}
