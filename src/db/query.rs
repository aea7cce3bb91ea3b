use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::models::{Album, Bbox, Embedding, Photo, StoredFace, StoredPattern, StoredPerson, User};
use crate::staging::codec;

/// `clusters` row: (id, parent_id, center_pattern_id, not_recalc_patt_del).
pub type ClusterRow = (i64, Option<i64>, Option<i64>, i64);

/// A pattern as the cluster tree sees it.
#[derive(Debug, Clone)]
pub struct PatternLeafRow {
    pub id: i64,
    pub person_id: i64,
    pub owner_id: i64,
    pub cluster_id: i64,
    pub registered: bool,
    pub center: Embedding,
}

const FACE_COLUMNS: &str =
    "f.id, f.photo_id, f.face_index, f.loc_top, f.loc_right, f.loc_bottom, f.loc_left, f.encoding, f.pattern_id";

fn decode_encoding_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Embedding> {
    let blob: Vec<u8> = row.get(idx)?;
    codec::decode_embedding(&blob)
        .map_err(|m| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::from(m)))
}

fn row_to_face(row: &Row<'_>) -> rusqlite::Result<StoredFace> {
    Ok(StoredFace {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        index: row.get(2)?,
        location: Bbox::new(row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?),
        encoding: decode_encoding_column(row, 7)?,
        pattern_id: row.get(8)?,
    })
}

fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let path: String = row.get(3)?;
    Ok(Photo {
        id: row.get(0)?,
        album_id: row.get(1)?,
        slug: row.get(2)?,
        path: PathBuf::from(path),
        is_private: row.get(4)?,
        faces_extracted: row.get(5)?,
    })
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<Option<User>> {
    let user = conn
        .query_row("SELECT id, username FROM users WHERE id = ?", params![user_id], |r| {
            Ok(User { id: r.get(0)?, username: r.get(1)? })
        })
        .optional()?;
    Ok(user)
}

pub fn get_album(conn: &Connection, album_id: i64) -> Result<Option<Album>> {
    let album = conn
        .query_row("SELECT id, owner_id, title FROM albums WHERE id = ?", params![album_id], |r| {
            Ok(Album { id: r.get(0)?, owner_id: r.get(1)?, title: r.get(2)? })
        })
        .optional()?;
    Ok(album)
}

pub fn get_photo(conn: &Connection, photo_id: i64) -> Result<Option<Photo>> {
    let photo = conn
        .query_row(
            "SELECT id, album_id, slug, path, is_private, faces_extracted FROM photos WHERE id = ?",
            params![photo_id],
            row_to_photo,
        )
        .optional()?;
    Ok(photo)
}

/// Photos of an album in upload order.
pub fn list_album_photos(conn: &Connection, album_id: i64) -> Result<Vec<Photo>> {
    let mut stmt = conn.prepare(
        "SELECT id, album_id, slug, path, is_private, faces_extracted FROM photos WHERE album_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map(params![album_id], row_to_photo)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Slug -> photo id for one album.
pub fn album_photo_ids_by_slug(conn: &Connection, album_id: i64) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT slug, id FROM photos WHERE album_id = ?")?;
    let rows = stmt.query_map(params![album_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
}

/// Whether the owner already has recognized faces outside `exclude_album`.
pub fn owner_has_faces(conn: &Connection, owner_id: i64, exclude_album: i64) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM faces f
             JOIN patterns p ON p.id = f.pattern_id
             JOIN persons pe ON pe.id = p.person_id
             JOIN photos ph ON ph.id = f.photo_id
             WHERE pe.owner_id = ?1 AND ph.album_id != ?2)",
        params![owner_id, exclude_album],
        |r| r.get(0),
    )?;
    Ok(found)
}

pub fn get_face(conn: &Connection, face_id: i64) -> Result<Option<StoredFace>> {
    let sql = format!("SELECT {} FROM faces f WHERE f.id = ?", FACE_COLUMNS);
    Ok(conn.query_row(&sql, params![face_id], row_to_face).optional()?)
}

pub fn pattern_faces(conn: &Connection, pattern_id: i64) -> Result<Vec<StoredFace>> {
    let sql = format!("SELECT {} FROM faces f WHERE f.pattern_id = ? ORDER BY f.id", FACE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![pattern_id], row_to_face)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn photo_face_ids(conn: &Connection, photo_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM faces WHERE photo_id = ? ORDER BY id")?;
    let rows = stmt.query_map(params![photo_id], |r| r.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn album_face_ids(conn: &Connection, album_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT f.id FROM faces f JOIN photos ph ON ph.id = f.photo_id WHERE ph.album_id = ? ORDER BY f.id",
    )?;
    let rows = stmt.query_map(params![album_id], |r| r.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn pattern_header(conn: &Connection, pattern_id: i64) -> Result<Option<StoredPattern>> {
    let pattern = conn
        .query_row(
            "SELECT id, person_id, central_face_id, cluster_id, registered_in_cluster FROM patterns WHERE id = ?",
            params![pattern_id],
            |r| {
                Ok(StoredPattern {
                    id: r.get(0)?,
                    person_id: r.get(1)?,
                    central_face_id: r.get(2)?,
                    cluster_id: r.get(3)?,
                    registered_in_cluster: r.get(4)?,
                    faces: Vec::new(),
                })
            },
        )
        .optional()?;
    Ok(pattern)
}

pub fn get_pattern(conn: &Connection, pattern_id: i64) -> Result<Option<StoredPattern>> {
    match pattern_header(conn, pattern_id)? {
        Some(mut p) => {
            p.faces = pattern_faces(conn, pattern_id)?;
            Ok(Some(p))
        }
        None => Ok(None),
    }
}

pub fn person_pattern_ids(conn: &Connection, person_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM patterns WHERE person_id = ? ORDER BY id")?;
    let rows = stmt.query_map(params![person_id], |r| r.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn get_person(conn: &Connection, person_id: i64) -> Result<Option<StoredPerson>> {
    let head = conn
        .query_row("SELECT id, owner_id, name FROM persons WHERE id = ?", params![person_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?))
        })
        .optional()?;
    let Some((id, owner_id, name)) = head else {
        return Ok(None);
    };
    let mut patterns = Vec::new();
    for pid in person_pattern_ids(conn, id)? {
        if let Some(p) = get_pattern(conn, pid)? {
            patterns.push(p);
        }
    }
    Ok(Some(StoredPerson { id, owner_id, name, patterns }))
}

/// The owner's persons with every face from `exclude_album` left out.
/// Patterns that end up empty are dropped, and so are persons without patterns.
pub fn owner_persons(conn: &Connection, owner_id: i64, exclude_album: Option<i64>) -> Result<Vec<StoredPerson>> {
    let mut stmt = conn.prepare("SELECT id, name FROM persons WHERE owner_id = ? ORDER BY id")?;
    let heads = stmt
        .query_map(params![owner_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let excluded: Vec<i64> = match exclude_album {
        Some(a) => {
            let mut s = conn.prepare("SELECT id FROM photos WHERE album_id = ?")?;
            let ids = s.query_map(params![a], |r| r.get(0))?.collect::<Result<Vec<_>, _>>()?;
            ids
        }
        None => Vec::new(),
    };

    let mut out = Vec::new();
    for (id, name) in heads {
        let mut patterns = Vec::new();
        for pid in person_pattern_ids(conn, id)? {
            let Some(mut p) = get_pattern(conn, pid)? else { continue };
            p.faces.retain(|f| !excluded.contains(&f.photo_id));
            if !p.faces.is_empty() {
                patterns.push(p);
            }
        }
        if !patterns.is_empty() {
            out.push(StoredPerson { id, owner_id, name, patterns });
        }
    }
    Ok(out)
}

pub fn person_owner(conn: &Connection, person_id: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT owner_id FROM persons WHERE id = ?", params![person_id], |r| r.get(0))
        .optional()?)
}

pub fn load_clusters(conn: &Connection) -> Result<Vec<ClusterRow>> {
    let mut stmt =
        conn.prepare("SELECT id, parent_id, center_pattern_id, not_recalc_patt_del FROM clusters ORDER BY id")?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Patterns placed in the tree together with their central-face encoding.
pub fn load_pattern_leaves(conn: &Connection) -> Result<Vec<PatternLeafRow>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.person_id, pe.owner_id, p.cluster_id, p.registered_in_cluster, f.encoding
         FROM patterns p
         JOIN persons pe ON pe.id = p.person_id
         JOIN faces f ON f.id = p.central_face_id
         WHERE p.cluster_id IS NOT NULL
         ORDER BY p.id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(PatternLeafRow {
            id: r.get(0)?,
            person_id: r.get(1)?,
            owner_id: r.get(2)?,
            cluster_id: r.get(3)?,
            registered: r.get(4)?,
            center: decode_encoding_column(r, 5)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let sql = match table {
        "faces" => "SELECT COUNT(*) FROM faces",
        "patterns" => "SELECT COUNT(*) FROM patterns",
        "persons" => "SELECT COUNT(*) FROM persons",
        "clusters" => "SELECT COUNT(*) FROM clusters",
        "photos" => "SELECT COUNT(*) FROM photos",
        other => anyhow::bail!("unknown table {}", other),
    };
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}
