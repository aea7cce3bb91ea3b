use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
}

/// A photo as the recognition core sees it. Original bytes are read from `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: i64,
    pub album_id: i64,
    pub slug: String,
    pub path: PathBuf,
    pub is_private: bool,
    pub faces_extracted: bool,
}

impl Photo {
    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}
