//! Stages 6 to 8: pair the album's new people with people the owner
//! already has, then let the user confirm or add pairs.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use super::matching::{medoid_index, person_distance, PatternView};
use super::{verify, PipelineContext, Transition};
use crate::db::query;
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::{Album, DetectedFace, Embedding, Stage, StoredPerson};
use crate::staging::{AlbumState, StagedFaceRef, StagedPattern, StagedPerson};

/// (central encoding, member encodings) of one pattern.
type PatternSet<'a> = Vec<(&'a Embedding, Vec<&'a Embedding>)>;

/// Accept the closest pairs first, skipping any pair whose side is already
/// taken. Candidates are (distance, existing person, new person). The order
/// is total so the result does not depend on how the input was listed.
pub fn pair_people(mut candidates: Vec<(f64, i64, usize)>) -> Vec<(usize, i64)> {
    candidates.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });
    let mut used_new = BTreeSet::new();
    let mut used_existing = BTreeSet::new();
    let mut out = Vec::new();
    for (_, existing, new) in candidates {
        if used_new.contains(&new) || used_existing.contains(&existing) {
            continue;
        }
        used_new.insert(new);
        used_existing.insert(existing);
        out.push((new, existing));
    }
    out
}

fn staged_set<'a>(
    person: &StagedPerson,
    patterns: &[StagedPattern],
    faces: &'a HashMap<StagedFaceRef, DetectedFace>,
    album_id: i64,
) -> RecognitionResult<PatternSet<'a>> {
    let mut out = Vec::with_capacity(person.patterns.len());
    for i in &person.patterns {
        let pattern = patterns.get(i - 1).ok_or(RecognitionError::TtlExpired(album_id))?;
        let members = pattern
            .faces
            .iter()
            .map(|r| faces.get(r).map(|f| &f.encoding))
            .collect::<Option<Vec<_>>>()
            .ok_or(RecognitionError::TtlExpired(album_id))?;
        let central = members
            .get(pattern.central - 1)
            .copied()
            .ok_or(RecognitionError::TtlExpired(album_id))?;
        out.push((central, members));
    }
    Ok(out)
}

fn stored_set(person: &StoredPerson) -> PatternSet<'_> {
    person
        .patterns
        .iter()
        .filter_map(|p| {
            let members = p.encodings();
            // the stored central face may belong to the excluded album
            let central = match p.central_face() {
                Some(f) => &f.encoding,
                None => members[medoid_index(&members)?],
            };
            Some((central, members))
        })
        .collect()
}

fn views<'a>(set: &'a PatternSet<'a>) -> Vec<PatternView<'a>> {
    set.iter().map(|(central, faces)| PatternView { central: *central, faces: faces.as_slice() }).collect()
}

/// Stage 6.
pub fn run(ctx: &PipelineContext, album_id: i64) -> RecognitionResult<Transition> {
    let album = ctx.album(album_id)?;
    let state = ctx.album_state(album_id);
    let patterns = state.patterns()?;
    let persons = state.persons()?;
    if persons.is_empty() {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let faces = state.all_faces()?;
    let existing = ctx.read_db(|c| query::owner_persons(c, album.owner_id, Some(album_id)))?;

    let new_sets = persons
        .iter()
        .map(|p| staged_set(p, &patterns, &faces, album_id))
        .collect::<RecognitionResult<Vec<_>>>()?;
    let old_sets: Vec<(i64, PatternSet<'_>)> = existing.iter().map(|p| (p.id, stored_set(p))).collect();

    let mut candidates = Vec::new();
    for (existing_id, old) in &old_sets {
        let old_views = views(old);
        for (k, new) in new_sets.iter().enumerate() {
            let Some(d) = person_distance(&old_views, &views(new)) else { continue };
            debug!("album {}: person_{} to person {} distance {:.4}", album_id, k + 1, existing_id, d);
            if d <= ctx.settings.face_recognition_tolerance {
                candidates.push((d, *existing_id, k + 1));
            }
        }
    }

    let pairs = pair_people(candidates);
    for (new, existing_id) in &pairs {
        state.set_tech_pair(*new, *existing_id)?;
    }
    info!("album {}: {} of {} new people matched to known people", album_id, pairs.len(), persons.len());

    if pairs.is_empty() {
        Ok(Transition::Enter(Stage::Commit))
    } else {
        Ok(Transition::Enter(Stage::VerifyMatches))
    }
}

/// New people without a confirmed pair, and the owner's people nobody was
/// paired with.
fn unpaired(
    ctx: &PipelineContext,
    album: &Album,
    state: &AlbumState<'_>,
) -> RecognitionResult<(BTreeSet<usize>, BTreeSet<i64>)> {
    let persons = state.persons()?;
    if persons.is_empty() {
        return Err(RecognitionError::TtlExpired(album.id));
    }
    let taken: BTreeSet<i64> = persons.iter().filter_map(|p| p.real_pair).collect();
    let new = persons
        .iter()
        .enumerate()
        .filter(|(_, p)| p.real_pair.is_none())
        .map(|(i, _)| i + 1)
        .collect();
    let existing = ctx
        .read_db(|c| query::owner_persons(c, album.owner_id, Some(album.id)))?
        .into_iter()
        .map(|p| p.id)
        .filter(|id| !taken.contains(id))
        .collect();
    Ok((new, existing))
}

/// Stage 7.
pub fn confirm(ctx: &PipelineContext, album_id: i64, payload: &Value) -> RecognitionResult<Transition> {
    let album = ctx.album(album_id)?;
    let state = ctx.album_state(album_id);
    let persons = state.persons()?;
    if persons.is_empty() {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let suggested: BTreeMap<usize, i64> = persons
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.tech_pair.map(|e| (i + 1, e)))
        .collect();
    let confirmed = verify::confirmed_matches(payload, &suggested)?;
    for (new, existing) in &confirmed {
        state.set_real_pair(*new, *existing)?;
    }
    info!("album {}: {} of {} suggested pairs confirmed", album_id, confirmed.len(), suggested.len());

    let (new, existing) = unpaired(ctx, &album, &state)?;
    if !new.is_empty() && !existing.is_empty() {
        Ok(Transition::Enter(Stage::ManualMatch))
    } else {
        Ok(Transition::Enter(Stage::Commit))
    }
}

/// Stage 8. An empty payload pairs nobody.
pub fn manual(ctx: &PipelineContext, album_id: i64, payload: &Value) -> RecognitionResult<Transition> {
    let album = ctx.album(album_id)?;
    let state = ctx.album_state(album_id);
    let (new, existing) = unpaired(ctx, &album, &state)?;
    let pairs = verify::manual_matches(payload, &new, &existing)?;
    for (n, e) in &pairs {
        state.set_real_pair(*n, *e)?;
    }
    info!("album {}: {} people paired by hand", album_id, pairs.len());
    Ok(Transition::Enter(Stage::Commit))
}
