pub mod cascade;
pub mod detector;
pub mod face_search;
pub mod frames;
pub mod matching;
pub mod patterns;
pub mod persist;
pub mod reconcile;
pub mod scheduler;
pub mod thumbs;
pub mod verify;

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::cluster::ClusterIndex;
use crate::db::query;
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::{Album, Finished, Stage};
use crate::staging::{AlbumState, StagedFaceRef, StagedPattern, StagedPerson, StagingStore};
use crate::utils::config::RecognitionSettings;
use detector::FaceDetector;

pub use scheduler::{AlbumStatus, Job, Recognizer, SearchStatus};

/// What a stage handler asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to `stage`: background stages start running, user stages wait
    /// for their payload.
    Enter(Stage),
    Finish(Finished),
}

/// Everything a stage handler needs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: Arc<Mutex<Connection>>,
    pub staging: Arc<dyn StagingStore>,
    pub index: Arc<ClusterIndex>,
    pub detector: Arc<dyn FaceDetector>,
    pub settings: RecognitionSettings,
    /// Scratch root for per-album thumbnails.
    pub temp_root: PathBuf,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("index", &self.index)
            .field("settings", &self.settings)
            .field("temp_root", &self.temp_root)
            .finish()
    }
}

impl PipelineContext {
    pub fn album_state(&self, album_id: i64) -> AlbumState<'_> {
        AlbumState::new(self.staging.as_ref(), album_id)
    }

    /// Short read against the durable store.
    pub fn read_db<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> RecognitionResult<T> {
        let conn = self.db.lock();
        Ok(f(&conn)?)
    }

    /// Run `f` in one transaction. On failure the transaction rolls back and
    /// the cluster index is reloaded so it matches the durable rows again.
    pub fn write_txn<T>(&self, f: impl FnOnce(&Connection) -> RecognitionResult<T>) -> RecognitionResult<T> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        match f(&*tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                drop(tx);
                if let Err(reload) = self.index.reload(&conn) {
                    error!("cluster index reload after rollback failed: {}", reload);
                }
                Err(e)
            }
        }
    }

    pub fn album(&self, album_id: i64) -> RecognitionResult<Album> {
        self.read_db(|c| query::get_album(c, album_id))?
            .ok_or_else(|| RecognitionError::NotFound(format!("album {}", album_id)))
    }

    /// Stage 6 when the owner has people to match against, stage 9 otherwise.
    pub fn reconcile_or_commit(&self, album: &Album) -> RecognitionResult<Transition> {
        let prior = self.read_db(|c| query::owner_has_faces(c, album.owner_id, album.id))?;
        Ok(Transition::Enter(if prior { Stage::Reconcile } else { Stage::Commit }))
    }
}

/// Stage a lone face as pattern 1 of person 1 so grouping can be skipped.
pub fn stage_single_face(state: &AlbumState<'_>, slug: &str) -> RecognitionResult<()> {
    state.delete_patterns()?;
    state.delete_persons()?;
    let pattern = StagedPattern {
        faces: vec![StagedFaceRef { slug: slug.to_string(), index: 1 }],
        central: 1,
        person: Some(1),
    };
    state.write_pattern(1, &pattern)?;
    stage_single_person(state)
}

/// With exactly one staged pattern, make it the only person.
pub fn stage_single_person(state: &AlbumState<'_>) -> RecognitionResult<()> {
    state.set_pattern_person(1, 1)?;
    state.write_person(1, &StagedPerson { patterns: vec![1], tech_pair: None, real_pair: None })?;
    state.set_verified_patterns(1)?;
    state.set_people_amount(1)?;
    Ok(())
}

/// Queue depth and running jobs of the recognition pool.
#[derive(Debug, Default)]
pub struct RecognitionGauges {
    pub queued: AtomicUsize,
    pub running: AtomicUsize,
}

impl RecognitionGauges {
    pub fn depths(&self) -> (usize, usize) {
        (self.queued.load(Ordering::Relaxed), self.running.load(Ordering::Relaxed))
    }
}
