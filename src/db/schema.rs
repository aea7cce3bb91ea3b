use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Fixed id of the cluster tree root.
pub const ROOT_CLUSTER_ID: i64 = 1;

pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "page_size", 4096i64)?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  username TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS albums (
  id INTEGER PRIMARY KEY,
  owner_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  FOREIGN KEY(owner_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS photos (
  id INTEGER PRIMARY KEY,
  album_id INTEGER NOT NULL,
  slug TEXT NOT NULL UNIQUE,
  path TEXT NOT NULL,
  is_private INTEGER NOT NULL DEFAULT 0,
  faces_extracted INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY(album_id) REFERENCES albums(id)
);

CREATE INDEX IF NOT EXISTS idx_photos_album ON photos(album_id);

CREATE TABLE IF NOT EXISTS persons (
  id INTEGER PRIMARY KEY,
  owner_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  FOREIGN KEY(owner_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_persons_owner ON persons(owner_id);

CREATE TABLE IF NOT EXISTS clusters (
  id INTEGER PRIMARY KEY,
  parent_id INTEGER,
  center_pattern_id INTEGER,
  not_recalc_patt_del INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY(parent_id) REFERENCES clusters(id)
);

CREATE TABLE IF NOT EXISTS patterns (
  id INTEGER PRIMARY KEY,
  person_id INTEGER NOT NULL,
  central_face_id INTEGER,
  cluster_id INTEGER,
  registered_in_cluster INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY(person_id) REFERENCES persons(id),
  FOREIGN KEY(cluster_id) REFERENCES clusters(id)
);

CREATE INDEX IF NOT EXISTS idx_patterns_person ON patterns(person_id);
CREATE INDEX IF NOT EXISTS idx_patterns_cluster ON patterns(cluster_id);

CREATE TABLE IF NOT EXISTS faces (
  id INTEGER PRIMARY KEY,
  photo_id INTEGER NOT NULL,
  face_index INTEGER NOT NULL,
  loc_top INTEGER NOT NULL,
  loc_right INTEGER NOT NULL,
  loc_bottom INTEGER NOT NULL,
  loc_left INTEGER NOT NULL,
  encoding BLOB NOT NULL,
  pattern_id INTEGER NOT NULL,
  FOREIGN KEY(photo_id) REFERENCES photos(id),
  FOREIGN KEY(pattern_id) REFERENCES patterns(id)
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_pattern ON faces(pattern_id);
    "#,
    )?;
    Ok(())
}

/// The cluster tree always has a root; create it on first open.
pub fn ensure_root_cluster(conn: &Connection) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT id FROM clusters WHERE id = ?", params![ROOT_CLUSTER_ID], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        conn.execute(
            "INSERT INTO clusters (id, parent_id, center_pattern_id, not_recalc_patt_del) VALUES (?1, NULL, NULL, 0)",
            params![ROOT_CLUSTER_ID],
        )?;
    }
    Ok(())
}
