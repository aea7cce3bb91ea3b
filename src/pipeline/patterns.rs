//! Stages 3 to 5: build patterns from the reviewed faces, split them on
//! request and group them into persons.

use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

use super::matching::{match_fraction, medoid_index};
use super::{stage_single_person, thumbs, verify, PipelineContext, Transition};
use crate::db::query;
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::{Bbox, DetectedFace, Embedding, Stage};
use crate::staging::{StagedFaceRef, StagedPattern, StagedPerson};
use crate::utils::config::RecognitionSettings;

/// Walk photos and faces in order; each face joins the first pattern it
/// matches well enough, otherwise starts a new one. Members are
/// (photo position, face position), both 0-based.
pub fn group_faces(photos: &[Vec<DetectedFace>], settings: &RecognitionSettings) -> Vec<Vec<(usize, usize)>> {
    let mut patterns: Vec<Vec<(usize, usize)>> = Vec::new();
    for (p, faces) in photos.iter().enumerate() {
        for (f, face) in faces.iter().enumerate() {
            let hit = patterns.iter().position(|members| {
                let encodings: Vec<&Embedding> = members.iter().map(|(mp, mf)| &photos[*mp][*mf].encoding).collect();
                match_fraction(&face.encoding, &encodings, settings.face_recognition_tolerance)
                    > settings.pattern_equality_tolerance
            });
            match hit {
                Some(i) => patterns[i].push((p, f)),
                None => patterns.push(vec![(p, f)]),
            }
        }
    }
    patterns
}

/// Stage 3.
pub fn build(ctx: &PipelineContext, album_id: i64) -> RecognitionResult<Transition> {
    let state = ctx.album_state(album_id);
    let slugs = state.photos()?;
    if slugs.is_empty() {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let mut faces = Vec::with_capacity(slugs.len());
    for slug in &slugs {
        faces.push(state.photo_faces(slug)?);
    }

    let grouped = group_faces(&faces, &ctx.settings);
    state.delete_patterns()?;
    let mut per_photo: Vec<Vec<(usize, usize, Bbox)>> = vec![Vec::new(); slugs.len()];
    for (i, members) in grouped.iter().enumerate() {
        let encodings: Vec<&Embedding> = members.iter().map(|(p, f)| &faces[*p][*f].encoding).collect();
        let central = medoid_index(&encodings).unwrap_or(0) + 1;
        let refs = members
            .iter()
            .map(|(p, f)| StagedFaceRef { slug: slugs[*p].clone(), index: f + 1 })
            .collect();
        state.write_pattern(i + 1, &StagedPattern { faces: refs, central, person: None })?;
        for (j, (p, f)) in members.iter().enumerate() {
            per_photo[*p].push((i + 1, j + 1, faces[*p][*f].location));
        }
    }
    info!("album {}: {} patterns built", album_id, grouped.len());

    render_thumbnails(ctx, album_id, &slugs, per_photo)?;
    Ok(Transition::Enter(Stage::VerifyPatterns))
}

fn render_thumbnails(
    ctx: &PipelineContext,
    album_id: i64,
    slugs: &[String],
    per_photo: Vec<Vec<(usize, usize, Bbox)>>,
) -> RecognitionResult<()> {
    let paths: HashMap<String, std::path::PathBuf> = ctx
        .read_db(|c| query::list_album_photos(c, album_id))?
        .into_iter()
        .map(|p| (p.slug, p.path))
        .collect();
    let temp_root = ctx.temp_root.as_path();
    slugs.par_iter().zip(per_photo.par_iter()).for_each(|(slug, jobs)| {
        let Some(path) = paths.get(slug) else {
            warn!("album {}: photo {} no longer exists, no thumbnails", album_id, slug);
            return;
        };
        match std::fs::read(path) {
            Ok(bytes) => thumbs::render_photo_faces(temp_root, album_id, &bytes, jobs),
            Err(e) => warn!("album {}: cannot read {:?} for thumbnails: {}", album_id, path, e),
        }
    });
    Ok(())
}

/// Stage 4: every marked group becomes a new pattern appended after the
/// existing ones.
pub fn split(ctx: &PipelineContext, album_id: i64, payload: &Value) -> RecognitionResult<Transition> {
    let state = ctx.album_state(album_id);
    let patterns = state.patterns()?;
    if patterns.is_empty() {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let counts: Vec<usize> = patterns.iter().map(|p| p.faces.len()).collect();
    let splits = verify::pattern_splits(payload, &counts)?;
    let faces = state.all_faces()?;

    // (old pattern, old face), 1-based, for every resulting pattern
    let mut layout: Vec<Vec<(usize, usize)>> = Vec::with_capacity(patterns.len());
    let mut split_off = Vec::new();
    for (i, groups) in splits.iter().enumerate() {
        let marked: BTreeSet<usize> = groups.iter().flatten().copied().collect();
        layout.push((1..=counts[i]).filter(|j| !marked.contains(j)).map(|j| (i + 1, j)).collect());
        for group in groups {
            let mut members = group.clone();
            members.sort_unstable();
            split_off.push(members.into_iter().map(|j| (i + 1, j)).collect::<Vec<_>>());
        }
    }
    layout.extend(split_off);

    let mut rebuilt = Vec::with_capacity(layout.len());
    let mut moves = Vec::new();
    for (n, members) in layout.iter().enumerate() {
        let refs: Vec<StagedFaceRef> = members
            .iter()
            .map(|(op, of)| patterns[op - 1].faces[of - 1].clone())
            .collect();
        let encodings = refs
            .iter()
            .map(|r| faces.get(r).map(|f| &f.encoding))
            .collect::<Option<Vec<_>>>()
            .ok_or(RecognitionError::TtlExpired(album_id))?;
        let central = medoid_index(&encodings).unwrap_or(0) + 1;
        for (k, old) in members.iter().enumerate() {
            if *old != (n + 1, k + 1) {
                moves.push((*old, (n + 1, k + 1)));
            }
        }
        rebuilt.push(StagedPattern { faces: refs, central, person: None });
    }

    state.delete_patterns()?;
    for (n, p) in rebuilt.iter().enumerate() {
        state.write_pattern(n + 1, p)?;
    }
    state.set_verified_patterns(rebuilt.len())?;
    if let Err(e) = thumbs::relocate(&ctx.temp_root, album_id, &moves) {
        warn!("album {}: thumbnails not rearranged: {}", album_id, e);
    }
    info!("album {}: {} patterns after review", album_id, rebuilt.len());

    if rebuilt.len() == 1 {
        stage_single_person(&state)?;
        let album = ctx.album(album_id)?;
        return ctx.reconcile_or_commit(&album);
    }
    Ok(Transition::Enter(Stage::GroupPatterns))
}

/// Stage 5.
pub fn group(ctx: &PipelineContext, album_id: i64, payload: &Value) -> RecognitionResult<Transition> {
    let state = ctx.album_state(album_id);
    let count = state.patterns_count()?;
    if count == 0 {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let persons = verify::groups(payload, count)?;

    state.delete_persons()?;
    for (k, members) in persons.iter().enumerate() {
        for p in members {
            state.set_pattern_person(*p, k + 1)?;
        }
        state.write_person(k + 1, &StagedPerson { patterns: members.clone(), ..Default::default() })?;
    }
    state.set_people_amount(persons.len())?;
    info!("album {}: {} patterns grouped into {} people", album_id, count, persons.len());

    let album = ctx.album(album_id)?;
    ctx.reconcile_or_commit(&album)
}
