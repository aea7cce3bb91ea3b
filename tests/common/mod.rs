#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use rusqlite::Connection;
use tempfile::TempDir;

use nazr_recognition::cluster::{ClusterIndex, PatternLeaf};
use nazr_recognition::db::{self, query, writer};
use nazr_recognition::models::{Bbox, DetectedFace, Embedding, Stage, EMBEDDING_DIM};
use nazr_recognition::pipeline::detector::FaceDetector;
use nazr_recognition::pipeline::{PipelineContext, Recognizer};
use nazr_recognition::staging::{AlbumState, MemoryStore, StagingError, StagingResult, StagingStore};
use nazr_recognition::utils::config::RecognitionSettings;
use nazr_recognition::{AppPaths, AppState};

/// Embedding with `x` on the first axis and zeros elsewhere.
pub fn emb(x: f64) -> Embedding {
    emb2(x, 0.0)
}

pub fn emb2(x: f64, y: f64) -> Embedding {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[0] = x;
    v[1] = y;
    Embedding::new(v).unwrap()
}

/// A detected face at `x` inside a 64x64 photo.
pub fn face(x: f64) -> DetectedFace {
    DetectedFace { location: Bbox::new(8, 40, 40, 8), encoding: emb(x) }
}

enum Scripted {
    Faces(Vec<DetectedFace>),
    Fail,
}

/// Detector answering from a table keyed by the exact image bytes.
/// Unknown images have no faces.
#[derive(Default)]
pub struct ScriptedDetector {
    table: Mutex<HashMap<Vec<u8>, Scripted>>,
}

impl ScriptedDetector {
    pub fn answer(&self, image: Vec<u8>, faces: Vec<DetectedFace>) {
        self.table.lock().insert(image, Scripted::Faces(faces));
    }

    pub fn fail_on(&self, image: Vec<u8>) {
        self.table.lock().insert(image, Scripted::Fail);
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, image: &[u8]) -> anyhow::Result<Vec<DetectedFace>> {
        match self.table.lock().get(image) {
            Some(Scripted::Faces(faces)) => Ok(faces.clone()),
            Some(Scripted::Fail) => Err(anyhow!("scripted detector failure")),
            None => Ok(Vec::new()),
        }
    }
}

/// In-memory staging that can be told to lose the connection once while
/// an album sits at stage 9, the way a remote store fails mid-teardown.
pub struct TestStore {
    inner: MemoryStore,
    teardown_fault: Mutex<Option<i64>>,
}

impl TestStore {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: MemoryStore::new(ttl), teardown_fault: Mutex::new(None) }
    }

    /// The first deletion issued while `album_id` is at stage 9 fails.
    pub fn fail_teardown(&self, album_id: i64) {
        *self.teardown_fault.lock() = Some(album_id);
    }

    fn check_fault(&self) -> StagingResult<()> {
        let mut fault = self.teardown_fault.lock();
        if let Some(album_id) = *fault {
            if AlbumState::new(&self.inner, album_id).current_stage()? == Some(Stage::Commit) {
                *fault = None;
                return Err(StagingError::Storage("connection reset".to_string()));
            }
        }
        Ok(())
    }
}

impl StagingStore for TestStore {
    fn get(&self, key: &str) -> StagingResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn set(&self, key: &str, value: &[u8]) -> StagingResult<()> {
        self.inner.set(key, value)
    }
    fn incr_by(&self, key: &str, by: i64) -> StagingResult<i64> {
        self.inner.incr_by(key, by)
    }
    fn hget(&self, key: &str, field: &str) -> StagingResult<Option<Vec<u8>>> {
        self.inner.hget(key, field)
    }
    fn hset(&self, key: &str, field: &str, value: &[u8]) -> StagingResult<()> {
        self.inner.hset(key, field, value)
    }
    fn hdel(&self, key: &str, field: &str) -> StagingResult<bool> {
        self.inner.hdel(key, field)
    }
    fn hexists(&self, key: &str, field: &str) -> StagingResult<bool> {
        self.inner.hexists(key, field)
    }
    fn hgetall(&self, key: &str) -> StagingResult<Vec<(String, Vec<u8>)>> {
        self.inner.hgetall(key)
    }
    fn hincr_by(&self, key: &str, field: &str, by: i64) -> StagingResult<i64> {
        self.inner.hincr_by(key, field, by)
    }
    fn rpush(&self, key: &str, value: &[u8]) -> StagingResult<usize> {
        self.inner.rpush(key, value)
    }
    fn lrange(&self, key: &str) -> StagingResult<Vec<Vec<u8>>> {
        self.inner.lrange(key)
    }
    fn lpos(&self, key: &str, value: &[u8]) -> StagingResult<Option<usize>> {
        self.inner.lpos(key, value)
    }
    fn lrem(&self, key: &str, value: &[u8]) -> StagingResult<usize> {
        self.inner.lrem(key, value)
    }
    fn exists(&self, key: &str) -> StagingResult<bool> {
        self.inner.exists(key)
    }
    fn delete(&self, key: &str) -> StagingResult<bool> {
        self.check_fault()?;
        self.inner.delete(key)
    }
    fn delete_prefix(&self, prefix: &str) -> StagingResult<usize> {
        self.check_fault()?;
        self.inner.delete_prefix(prefix)
    }
    fn keys(&self, prefix: &str) -> StagingResult<Vec<String>> {
        self.inner.keys(prefix)
    }
    fn expire(&self, key: &str, ttl: Duration) -> StagingResult<bool> {
        self.inner.expire(key, ttl)
    }
}

/// A data dir, a database, an in-memory staging store and a recognizer
/// that runs background stages inline.
pub struct TestEnv {
    pub tmp: TempDir,
    pub paths: AppPaths,
    pub detector: Arc<ScriptedDetector>,
    pub staging: Arc<TestStore>,
    pub recognizer: Recognizer,
    photos: Mutex<usize>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_settings(RecognitionSettings::default())
    }

    pub fn with_settings(settings: RecognitionSettings) -> Self {
        let tmp = TempDir::new().unwrap();
        let paths = AppPaths::under(tmp.path());
        std::fs::create_dir_all(paths.db_path.parent().unwrap()).unwrap();
        std::fs::create_dir_all(&paths.temp).unwrap();
        std::fs::create_dir_all(paths.data.join("photos")).unwrap();

        let conn = db::open_or_create(&paths.db_path).unwrap();
        let index = ClusterIndex::load(&conn, &settings).unwrap();
        let detector = Arc::new(ScriptedDetector::default());
        let staging = Arc::new(TestStore::new(Duration::from_secs(settings.staging_ttl_secs)));
        let ctx = PipelineContext {
            db: Arc::new(Mutex::new(conn)),
            staging: staging.clone(),
            index: Arc::new(index),
            detector: detector.clone(),
            settings,
            temp_root: paths.temp.clone(),
        };
        let recognizer = Recognizer::new(ctx);
        Self { tmp, paths, detector, staging, recognizer, photos: Mutex::new(0) }
    }

    pub fn ctx(&self) -> &PipelineContext {
        self.recognizer.context()
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(self.paths.clone(), self.recognizer.clone()))
    }

    pub fn state(&self, album_id: i64) -> AlbumState<'_> {
        self.ctx().album_state(album_id)
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.ctx().db.lock();
        f(&conn)
    }

    pub fn count(&self, table: &str) -> i64 {
        self.with_conn(|c| query::count_rows(c, table).unwrap())
    }

    pub fn user(&self, name: &str) -> i64 {
        self.with_conn(|c| writer::insert_user(c, name).unwrap())
    }

    pub fn album(&self, owner_id: i64, title: &str) -> i64 {
        self.with_conn(|c| writer::insert_album(c, owner_id, title).unwrap())
    }

    /// Write a small JPEG no other photo shares, register the faces the
    /// detector reports for it and add the photo row.
    pub fn photo(&self, album_id: i64, slug: &str, faces: Vec<DetectedFace>) -> i64 {
        let (id, bytes) = self.photo_file(album_id, slug, false);
        self.detector.answer(bytes, faces);
        id
    }

    pub fn private_photo(&self, album_id: i64, slug: &str, faces: Vec<DetectedFace>) -> i64 {
        let (id, bytes) = self.photo_file(album_id, slug, true);
        self.detector.answer(bytes, faces);
        id
    }

    pub fn broken_photo(&self, album_id: i64, slug: &str) -> i64 {
        let (id, bytes) = self.photo_file(album_id, slug, false);
        self.detector.fail_on(bytes);
        id
    }

    fn photo_file(&self, album_id: i64, slug: &str, private: bool) -> (i64, Vec<u8>) {
        let n = {
            let mut n = self.photos.lock();
            *n += 1;
            *n
        };
        let path = self.photo_path(album_id, slug);
        let color = image::Rgb([(n * 37 % 256) as u8, (n * 91 % 256) as u8, (n * 13 % 256) as u8]);
        image::RgbImage::from_pixel(64, 64, color).save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let id = self.with_conn(|c| writer::insert_photo(c, album_id, slug, &path, private).unwrap());
        (id, bytes)
    }

    fn photo_path(&self, album_id: i64, slug: &str) -> PathBuf {
        self.paths.data.join("photos").join(format!("{}_{}.jpg", album_id, slug))
    }

    /// A committed person with one single-face pattern at `at`, indexed.
    pub fn seed_person(&self, owner_id: i64, photo_id: i64, name: &str, at: Embedding) -> (i64, i64) {
        let ctx = self.ctx();
        let conn = ctx.db.lock();
        let person = writer::insert_person(&conn, owner_id, name).unwrap();
        let pattern = self.seed_pattern_in(&conn, owner_id, person, photo_id, at);
        (person, pattern)
    }

    /// Another indexed single-face pattern for an existing person.
    pub fn seed_pattern(&self, owner_id: i64, person_id: i64, photo_id: i64, at: Embedding) -> i64 {
        let conn = self.ctx().db.lock();
        self.seed_pattern_in(&conn, owner_id, person_id, photo_id, at)
    }

    fn seed_pattern_in(&self, conn: &Connection, owner_id: i64, person_id: i64, photo_id: i64, at: Embedding) -> i64 {
        let pattern = writer::insert_pattern(conn, person_id).unwrap();
        let face = writer::insert_face(conn, photo_id, 1, &Bbox::new(8, 40, 40, 8), &at, pattern).unwrap();
        writer::set_pattern_central_face(conn, pattern, face).unwrap();
        self.ctx().index.insert(conn, PatternLeaf::new(pattern, person_id, owner_id, at)).unwrap();
        pattern
    }
}
