use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;

use crate::models::{Bbox, Embedding};
use crate::staging::codec;

pub fn insert_user(conn: &Connection, username: &str) -> Result<i64> {
    conn.execute("INSERT INTO users (username) VALUES (?)", params![username])?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_album(conn: &Connection, owner_id: i64, title: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO albums (owner_id, title) VALUES (?1, ?2)",
        params![owner_id, title],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_photo(conn: &Connection, album_id: i64, slug: &str, path: &Path, is_private: bool) -> Result<i64> {
    conn.execute(
        "INSERT INTO photos (album_id, slug, path, is_private, faces_extracted) VALUES (?1, ?2, ?3, ?4, 0)",
        params![album_id, slug, path.to_string_lossy().to_string(), is_private],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_photo_private(conn: &Connection, photo_id: i64, is_private: bool) -> Result<bool> {
    let n = conn.execute(
        "UPDATE photos SET is_private = ?1 WHERE id = ?2",
        params![is_private, photo_id],
    )?;
    Ok(n > 0)
}

pub fn set_album_faces_extracted(conn: &Connection, album_id: i64, extracted: bool) -> Result<usize> {
    let n = conn.execute(
        "UPDATE photos SET faces_extracted = ?1 WHERE album_id = ?2",
        params![extracted, album_id],
    )?;
    Ok(n)
}

pub fn delete_photo_row(conn: &Connection, photo_id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM photos WHERE id = ?", params![photo_id])?;
    Ok(n > 0)
}

pub fn insert_person(conn: &Connection, owner_id: i64, name: &str) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO persons (owner_id, name, created_at) VALUES (?1, ?2, ?3)",
        params![owner_id, name, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn delete_person_row(conn: &Connection, person_id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM persons WHERE id = ?", params![person_id])?;
    Ok(n > 0)
}

/// New patterns start outside the cluster tree; the index assigns them.
pub fn insert_pattern(conn: &Connection, person_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO patterns (person_id, central_face_id, cluster_id, registered_in_cluster) VALUES (?1, NULL, NULL, 0)",
        params![person_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_pattern_central_face(conn: &Connection, pattern_id: i64, face_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE patterns SET central_face_id = ?1 WHERE id = ?2",
        params![face_id, pattern_id],
    )?;
    Ok(())
}

pub fn set_pattern_cluster(conn: &Connection, pattern_id: i64, cluster_id: Option<i64>, registered: bool) -> Result<()> {
    conn.execute(
        "UPDATE patterns SET cluster_id = ?1, registered_in_cluster = ?2 WHERE id = ?3",
        params![cluster_id, registered, pattern_id],
    )?;
    Ok(())
}

pub fn delete_pattern_row(conn: &Connection, pattern_id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM patterns WHERE id = ?", params![pattern_id])?;
    Ok(n > 0)
}

pub fn insert_face(
    conn: &Connection,
    photo_id: i64,
    index: i64,
    location: &Bbox,
    encoding: &Embedding,
    pattern_id: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO faces (photo_id, face_index, loc_top, loc_right, loc_bottom, loc_left, encoding, pattern_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            photo_id,
            index,
            location.top,
            location.right,
            location.bottom,
            location.left,
            codec::encode_embedding(encoding),
            pattern_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn delete_face_row(conn: &Connection, face_id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM faces WHERE id = ?", params![face_id])?;
    Ok(n > 0)
}

pub fn upsert_cluster(
    conn: &Connection,
    id: i64,
    parent_id: Option<i64>,
    center_pattern_id: Option<i64>,
    not_recalc_patt_del: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO clusters (id, parent_id, center_pattern_id, not_recalc_patt_del) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET parent_id = excluded.parent_id,
             center_pattern_id = excluded.center_pattern_id,
             not_recalc_patt_del = excluded.not_recalc_patt_del",
        params![id, parent_id, center_pattern_id, not_recalc_patt_del],
    )?;
    Ok(())
}

pub fn delete_cluster_row(conn: &Connection, cluster_id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM clusters WHERE id = ?", params![cluster_id])?;
    Ok(n > 0)
}
