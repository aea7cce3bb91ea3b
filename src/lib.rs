pub mod api;
pub mod cluster;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod staging;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub data: PathBuf,
    pub db_path: PathBuf,
    /// Per-album review thumbnails live under here.
    pub temp: PathBuf,
}

impl AppPaths {
    pub fn under(data: &Path) -> Self {
        Self {
            data: data.to_path_buf(),
            db_path: data.join("db").join("nazr.db"),
            temp: data.join("temp"),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub paths: AppPaths,
    pub recognizer: pipeline::Recognizer,
}

impl AppState {
    pub fn new(paths: AppPaths, recognizer: pipeline::Recognizer) -> Self {
        Self { started_at: Instant::now(), paths, recognizer }
    }
}
