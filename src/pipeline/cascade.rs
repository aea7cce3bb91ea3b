//! Durable deletions. Removing a face can empty its pattern, an empty
//! pattern leaves the cluster index and an empty person is removed.
//! The `*_in` functions run on the caller's transaction; the others open
//! their own.

use rusqlite::Connection;
use tracing::{debug, info};

use super::matching::medoid_index;
use super::PipelineContext;
use crate::cluster::ClusterIndex;
use crate::db::{query, writer};
use crate::error::{RecognitionError, RecognitionResult};

/// Point the pattern at the medoid of its current faces and refresh its
/// embedding in the index. Returns false when no faces are left.
pub fn refresh_center(index: &ClusterIndex, conn: &Connection, pattern_id: i64) -> RecognitionResult<bool> {
    let pattern = query::get_pattern(conn, pattern_id)?
        .ok_or_else(|| RecognitionError::NotFound(format!("pattern {}", pattern_id)))?;
    let encodings = pattern.encodings();
    let Some(m) = medoid_index(&encodings) else {
        return Ok(false);
    };
    let central = &pattern.faces[m];
    if pattern.central_face_id != Some(central.id) {
        writer::set_pattern_central_face(conn, pattern_id, central.id)?;
        if index.contains(pattern_id) {
            index.update_center(conn, pattern_id, central.encoding.clone())?;
        }
        debug!("pattern {} center moved to face {}", pattern_id, central.id);
    }
    Ok(true)
}

pub fn delete_face_in(index: &ClusterIndex, conn: &Connection, face_id: i64) -> RecognitionResult<()> {
    let face = query::get_face(conn, face_id)?.ok_or_else(|| RecognitionError::NotFound(format!("face {}", face_id)))?;
    writer::delete_face_row(conn, face_id)?;
    if !refresh_center(index, conn, face.pattern_id)? {
        delete_pattern_in(index, conn, face.pattern_id)?;
    }
    Ok(())
}

pub fn delete_pattern_in(index: &ClusterIndex, conn: &Connection, pattern_id: i64) -> RecognitionResult<()> {
    let pattern = query::get_pattern(conn, pattern_id)?
        .ok_or_else(|| RecognitionError::NotFound(format!("pattern {}", pattern_id)))?;
    for face in &pattern.faces {
        writer::delete_face_row(conn, face.id)?;
    }
    if index.contains(pattern_id) {
        index.remove(conn, pattern_id)?;
    }
    writer::delete_pattern_row(conn, pattern_id)?;
    if query::person_pattern_ids(conn, pattern.person_id)?.is_empty() {
        writer::delete_person_row(conn, pattern.person_id)?;
        debug!("person {} removed with its last pattern", pattern.person_id);
    }
    Ok(())
}

pub fn delete_person_in(index: &ClusterIndex, conn: &Connection, person_id: i64) -> RecognitionResult<()> {
    if query::person_owner(conn, person_id)?.is_none() {
        return Err(RecognitionError::NotFound(format!("person {}", person_id)));
    }
    for pattern_id in query::person_pattern_ids(conn, person_id)? {
        delete_pattern_in(index, conn, pattern_id)?;
    }
    writer::delete_person_row(conn, person_id)?;
    Ok(())
}

/// Remove every face found on `photo_id`; returns how many went away.
pub fn delete_photo_faces_in(index: &ClusterIndex, conn: &Connection, photo_id: i64) -> RecognitionResult<usize> {
    let ids = query::photo_face_ids(conn, photo_id)?;
    for id in &ids {
        delete_face_in(index, conn, *id)?;
    }
    Ok(ids.len())
}

pub fn delete_album_faces_in(index: &ClusterIndex, conn: &Connection, album_id: i64) -> RecognitionResult<usize> {
    let ids = query::album_face_ids(conn, album_id)?;
    for id in &ids {
        delete_face_in(index, conn, *id)?;
    }
    writer::set_album_faces_extracted(conn, album_id, false)?;
    Ok(ids.len())
}

pub fn delete_face(ctx: &PipelineContext, face_id: i64) -> RecognitionResult<()> {
    ctx.write_txn(|conn| delete_face_in(&ctx.index, conn, face_id))?;
    info!("face {} deleted", face_id);
    Ok(())
}

pub fn delete_pattern(ctx: &PipelineContext, pattern_id: i64) -> RecognitionResult<()> {
    ctx.write_txn(|conn| delete_pattern_in(&ctx.index, conn, pattern_id))?;
    info!("pattern {} deleted", pattern_id);
    Ok(())
}

pub fn delete_person(ctx: &PipelineContext, person_id: i64) -> RecognitionResult<()> {
    ctx.write_txn(|conn| delete_person_in(&ctx.index, conn, person_id))?;
    info!("person {} deleted", person_id);
    Ok(())
}

pub fn delete_photo(ctx: &PipelineContext, photo_id: i64) -> RecognitionResult<usize> {
    let removed = ctx.write_txn(|conn| {
        let removed = delete_photo_faces_in(&ctx.index, conn, photo_id)?;
        if !writer::delete_photo_row(conn, photo_id)? {
            return Err(RecognitionError::NotFound(format!("photo {}", photo_id)));
        }
        Ok(removed)
    })?;
    info!("photo {} deleted with {} faces", photo_id, removed);
    Ok(removed)
}

/// Making a photo private drops every face recognized on it.
pub fn set_photo_private(ctx: &PipelineContext, photo_id: i64, private: bool) -> RecognitionResult<usize> {
    let removed = ctx.write_txn(|conn| {
        if !writer::set_photo_private(conn, photo_id, private)? {
            return Err(RecognitionError::NotFound(format!("photo {}", photo_id)));
        }
        if private {
            delete_photo_faces_in(&ctx.index, conn, photo_id)
        } else {
            Ok(0)
        }
    })?;
    info!("photo {} private={} ({} faces removed)", photo_id, private, removed);
    Ok(removed)
}

pub fn delete_album_faces(ctx: &PipelineContext, album_id: i64) -> RecognitionResult<usize> {
    ctx.write_txn(|conn| delete_album_faces_in(&ctx.index, conn, album_id))
}
