//! Stage 9: write the album's people, patterns and faces in one transaction
//! and index the new patterns.

use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::cascade::{delete_album_faces_in, refresh_center};
use super::matching::patterns_equal;
use super::{PipelineContext, Transition};
use crate::cluster::PatternLeaf;
use crate::db::{query, writer};
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::{DetectedFace, Embedding, Finished};
use crate::staging::{StagedFaceRef, StagedPattern};

/// `<title[..20]>__<index>__<owner[..10]>`, counted in characters.
pub fn person_name(album_title: &str, index: usize, owner_name: &str) -> String {
    let title: String = album_title.chars().take(20).collect();
    let owner: String = owner_name.chars().take(10).collect();
    format!("{}__{}__{}", title, index, owner)
}

struct Staged<'a> {
    album_id: i64,
    faces: &'a HashMap<StagedFaceRef, DetectedFace>,
    photo_ids: &'a BTreeMap<String, i64>,
}

impl Staged<'_> {
    fn face(&self, r: &StagedFaceRef) -> RecognitionResult<&DetectedFace> {
        self.faces.get(r).ok_or(RecognitionError::TtlExpired(self.album_id))
    }

    fn encodings(&self, pattern: &StagedPattern) -> RecognitionResult<Vec<&Embedding>> {
        pattern.faces.iter().map(|r| self.face(r).map(|f| &f.encoding)).collect()
    }

    fn insert_faces(&self, conn: &Connection, pattern: &StagedPattern, pattern_id: i64) -> RecognitionResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(pattern.faces.len());
        for r in &pattern.faces {
            let face = self.face(r)?;
            let photo_id = self
                .photo_ids
                .get(&r.slug)
                .ok_or_else(|| RecognitionError::NotFound(format!("photo {}", r.slug)))?;
            ids.push(writer::insert_face(conn, *photo_id, r.index as i64, &face.location, &face.encoding, pattern_id)?);
        }
        Ok(ids)
    }

    /// New pattern under `person_id`, central face as staged.
    fn create_pattern(&self, conn: &Connection, person_id: i64, pattern: &StagedPattern) -> RecognitionResult<i64> {
        let pattern_id = writer::insert_pattern(conn, person_id)?;
        let ids = self.insert_faces(conn, pattern, pattern_id)?;
        let central = ids
            .get(pattern.central - 1)
            .ok_or_else(|| RecognitionError::InvariantViolation(format!("central face of pattern {}", pattern_id)))?;
        writer::set_pattern_central_face(conn, pattern_id, *central)?;
        Ok(pattern_id)
    }
}

pub fn commit(ctx: &PipelineContext, album_id: i64) -> RecognitionResult<Transition> {
    let album = ctx.album(album_id)?;
    let owner = ctx
        .read_db(|c| query::get_user(c, album.owner_id))?
        .ok_or_else(|| RecognitionError::NotFound(format!("user {}", album.owner_id)))?;
    let state = ctx.album_state(album_id);
    let patterns = state.patterns()?;
    let persons = state.persons()?;
    if persons.is_empty() {
        return Err(RecognitionError::TtlExpired(album_id));
    }
    let faces = state.all_faces()?;

    let (people, created) = ctx.write_txn(|conn| {
        // A commit that landed before its staging teardown failed is redone,
        // not duplicated.
        let stale = delete_album_faces_in(&ctx.index, conn, album_id)?;
        if stale > 0 {
            warn!("album {}: replacing {} faces from an earlier commit", album_id, stale);
        }
        let photo_ids = query::album_photo_ids_by_slug(conn, album_id)?;
        let staged = Staged { album_id, faces: &faces, photo_ids: &photo_ids };
        let mut created: Vec<(i64, i64)> = Vec::new();
        let mut people = 0usize;

        for (k, person) in persons.iter().enumerate() {
            let members = person
                .patterns
                .iter()
                .map(|i| patterns.get(i - 1).ok_or(RecognitionError::TtlExpired(album_id)))
                .collect::<RecognitionResult<Vec<_>>>()?;
            match person.real_pair {
                None => {
                    let person_id = writer::insert_person(conn, album.owner_id, &person_name(&album.title, k + 1, &owner.username))?;
                    people += 1;
                    for pattern in members {
                        created.push((staged.create_pattern(conn, person_id, pattern)?, person_id));
                    }
                }
                Some(target_id) => {
                    let target = query::get_person(conn, target_id)?
                        .filter(|p| p.owner_id == album.owner_id)
                        .ok_or_else(|| RecognitionError::NotFound(format!("person {}", target_id)))?;
                    for pattern in members {
                        let encodings = staged.encodings(pattern)?;
                        let same = target
                            .patterns
                            .iter()
                            .find(|p| patterns_equal(&p.encodings(), &encodings, &ctx.settings));
                        match same {
                            Some(existing) => {
                                staged.insert_faces(conn, pattern, existing.id)?;
                                refresh_center(&ctx.index, conn, existing.id)?;
                                debug!("album {}: faces merged into pattern {}", album_id, existing.id);
                            }
                            None => created.push((staged.create_pattern(conn, target_id, pattern)?, target_id)),
                        }
                    }
                }
            }
        }

        for (pattern_id, person_id) in &created {
            let center = query::get_pattern(conn, *pattern_id)?
                .and_then(|p| p.central_face().map(|f| f.encoding.clone()))
                .ok_or_else(|| RecognitionError::InvariantViolation(format!("pattern {} has no central face", pattern_id)))?;
            ctx.index.insert(conn, PatternLeaf::new(*pattern_id, *person_id, album.owner_id, center))?;
        }
        writer::set_album_faces_extracted(conn, album_id, true)?;
        Ok((people, created.len()))
    })?;

    info!("album {}: committed {} new people and {} new patterns", album_id, people, created);
    Ok(Transition::Finish(Finished::Done))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_truncated_by_characters() {
        assert_eq!(person_name("Summer", 2, "alice"), "Summer__2__alice");
        assert_eq!(
            person_name("Ünïcödé summer holidays 2024", 1, "bartholomew_long"),
            "Ünïcödé summer holid__1__bartholome"
        );
    }
}
