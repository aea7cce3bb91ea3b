//! Drives albums through the stage machine and runs similarity searches.
//!
//! At most one handler touches an album at a time: whoever holds the album
//! in the in-flight set (a request thread for user stages, a worker for
//! background stages) owns it until the next user input is awaited or the
//! run finishes.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{cascade, face_search, frames, patterns, persist, reconcile, thumbs};
use super::{PipelineContext, RecognitionGauges, Transition};
use crate::cluster::search::PeopleRanking;
use crate::db::query;
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::{Finished, Stage, Status};
use crate::staging::{keys, StagingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    RunStage { album_id: i64, stage: Stage },
    Search { person_id: i64 },
}

/// What `status(album)` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlbumStatus {
    pub album_id: i64,
    pub current_stage: Option<i64>,
    pub status: Option<String>,
    pub finished: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SearchStatus {
    InProgress { processed: i64, total: usize },
    Done { people: Vec<i64> },
}

#[derive(Clone)]
pub struct Recognizer {
    ctx: PipelineContext,
    queue: Option<mpsc::Sender<Job>>,
    albums: Arc<Mutex<HashSet<i64>>>,
    searches: Arc<Mutex<HashSet<i64>>>,
    gauges: Arc<RecognitionGauges>,
}

impl std::fmt::Debug for Recognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recognizer")
            .field("queued", &self.queue.is_some())
            .field("albums", &self.albums.lock().len())
            .field("searches", &self.searches.lock().len())
            .finish()
    }
}

impl Recognizer {
    /// Background stages and searches run inline on the calling thread.
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            queue: None,
            albums: Arc::new(Mutex::new(HashSet::new())),
            searches: Arc::new(Mutex::new(HashSet::new())),
            gauges: Arc::new(RecognitionGauges::default()),
        }
    }

    /// Background stages and searches go to `queue`; see [`start_workers`].
    pub fn with_queue(ctx: PipelineContext, queue: mpsc::Sender<Job>) -> Self {
        Self { queue: Some(queue), ..Self::new(ctx) }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn gauges(&self) -> &RecognitionGauges {
        &self.gauges
    }

    pub fn is_running(&self, album_id: i64) -> bool {
        self.albums.lock().contains(&album_id)
    }

    fn claim_album(&self, album_id: i64) -> RecognitionResult<()> {
        if self.albums.lock().insert(album_id) {
            Ok(())
        } else {
            Err(RecognitionError::AlbumBusy(album_id))
        }
    }

    fn release_album(&self, album_id: i64) {
        self.albums.lock().remove(&album_id);
    }

    fn release_job(&self, job: Job) {
        match job {
            Job::RunStage { album_id, .. } => self.release_album(album_id),
            Job::Search { person_id } => {
                self.searches.lock().remove(&person_id);
            }
        }
    }

    pub fn status(&self, album_id: i64) -> RecognitionResult<AlbumStatus> {
        self.ctx.album(album_id)?;
        let state = self.ctx.album_state(album_id);
        Ok(AlbumStatus {
            album_id,
            current_stage: state.current_stage()?.map(Stage::as_i64),
            status: state.status()?.map(|s| s.as_str().to_string()),
            finished: state.finished()?.map(|f| f.as_str().to_string()),
            running: self.is_running(album_id),
        })
    }

    /// Stage 0: drop everything the album accumulated, including faces
    /// committed by an earlier run, and start face search.
    pub fn start(&self, album_id: i64) -> RecognitionResult<AlbumStatus> {
        self.ctx.album(album_id)?;
        self.claim_album(album_id)?;
        if let Err(e) = self.reset(album_id) {
            self.release_album(album_id);
            return Err(e);
        }
        self.advance(album_id, Transition::Enter(Stage::FaceSearch))?;
        self.status(album_id)
    }

    fn reset(&self, album_id: i64) -> RecognitionResult<()> {
        let state = self.ctx.album_state(album_id);
        let cleared = state.clear()?;
        thumbs::remove_album_dir(&self.ctx.temp_root, album_id)?;
        let removed = cascade::delete_album_faces(&self.ctx, album_id)?;
        state.set_stage(Stage::Start, Status::Completed)?;
        info!("album {}: recognition started ({} staging keys, {} faces dropped)", album_id, cleared, removed);
        Ok(())
    }

    /// Validate `payload` for `stage` and apply it. Only the stage right
    /// after the current one is accepted, and only while nothing runs.
    pub fn submit(&self, album_id: i64, stage: i64, payload: &Value) -> RecognitionResult<AlbumStatus> {
        self.ctx.album(album_id)?;
        let state = self.ctx.album_state(album_id);
        let current = match state.current_stage()? {
            Some(s) => s,
            None if state.finished()?.is_some() => {
                return Err(RecognitionError::StaleStage { expected: Stage::Start.as_i64(), got: stage })
            }
            None => return Err(RecognitionError::TtlExpired(album_id)),
        };
        if state.status()? == Some(Status::Processing) || self.is_running(album_id) {
            return Err(RecognitionError::AlbumBusy(album_id));
        }
        let expected = current.as_i64() + 1;
        let target = Stage::from_i64(stage)
            .filter(|s| s.as_i64() == expected && s.is_user_submitted())
            .ok_or(RecognitionError::StaleStage { expected, got: stage })?;

        self.claim_album(album_id)?;
        match state.current_stage() {
            Ok(now) if now == Some(current) => {}
            Ok(_) => {
                self.release_album(album_id);
                return Err(RecognitionError::StaleStage { expected, got: stage });
            }
            Err(e) => {
                self.release_album(album_id);
                return Err(e.into());
            }
        }
        let outcome = match target {
            Stage::VerifyFrames => frames::apply(&self.ctx, album_id, payload),
            Stage::VerifyPatterns => patterns::split(&self.ctx, album_id, payload),
            Stage::GroupPatterns => patterns::group(&self.ctx, album_id, payload),
            Stage::VerifyMatches => reconcile::confirm(&self.ctx, album_id, payload),
            Stage::ManualMatch => reconcile::manual(&self.ctx, album_id, payload),
            other => Err(RecognitionError::InvariantViolation(format!("stage {} takes no payload", other))),
        };
        match outcome {
            Ok(next) => {
                info!("album {}: stage {} accepted", album_id, target);
                self.advance(album_id, next)?;
            }
            Err(e) => {
                self.release_album(album_id);
                return Err(e);
            }
        }
        self.status(album_id)
    }

    /// Requeue a background stage left in `processing` by a failed or lost
    /// worker.
    pub fn resume(&self, album_id: i64) -> RecognitionResult<AlbumStatus> {
        self.ctx.album(album_id)?;
        let state = self.ctx.album_state(album_id);
        let stage = state.current_stage()?.ok_or(RecognitionError::TtlExpired(album_id))?;
        if state.status()? != Some(Status::Processing) || !stage.is_background() {
            return self.status(album_id);
        }
        self.claim_album(album_id)?;
        warn!("album {}: resuming stage {}", album_id, stage);
        self.dispatch_stage(album_id, stage)?;
        self.status(album_id)
    }

    /// The caller holds the album claim. It moves to the job when `next` is
    /// a background stage and is released otherwise.
    fn advance(&self, album_id: i64, next: Transition) -> RecognitionResult<()> {
        if let Transition::Enter(stage) = next {
            if stage.is_background() {
                return self.dispatch_stage(album_id, stage);
            }
        }
        let result = self.settle(album_id, next);
        self.release_album(album_id);
        result
    }

    fn settle(&self, album_id: i64, next: Transition) -> RecognitionResult<()> {
        match next {
            Transition::Enter(stage) => {
                let waiting = Stage::from_i64(stage.as_i64() - 1)
                    .ok_or_else(|| RecognitionError::InvariantViolation(format!("no stage before {}", stage)))?;
                self.ctx.album_state(album_id).set_stage(waiting, Status::Completed)?;
                info!("album {}: waiting for stage {} input", album_id, stage);
                Ok(())
            }
            Transition::Finish(marker) => self.finalize(album_id, marker),
        }
    }

    fn finalize(&self, album_id: i64, marker: Finished) -> RecognitionResult<()> {
        let state = self.ctx.album_state(album_id);
        state.clear()?;
        thumbs::remove_album_dir(&self.ctx.temp_root, album_id)?;
        state.set_finished(marker)?;
        info!("album {}: recognition finished ({})", album_id, marker.as_str());
        Ok(())
    }

    fn dispatch_stage(&self, album_id: i64, stage: Stage) -> RecognitionResult<()> {
        if let Err(e) = self.ctx.album_state(album_id).set_stage(stage, Status::Processing) {
            self.release_album(album_id);
            return Err(e.into());
        }
        self.dispatch(Job::RunStage { album_id, stage })
    }

    fn dispatch(&self, job: Job) -> RecognitionResult<()> {
        match &self.queue {
            Some(tx) => {
                self.gauges.queued.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = tx.try_send(job) {
                    self.gauges.queued.fetch_sub(1, Ordering::Relaxed);
                    self.release_job(job);
                    return Err(RecognitionError::Backend(anyhow::anyhow!("recognition queue unavailable: {}", e)));
                }
                debug!("queued {:?}", job);
                Ok(())
            }
            None => {
                self.run_job(job);
                Ok(())
            }
        }
    }

    /// Execute one job. The job's album or person claim is released here.
    pub fn run_job(&self, job: Job) {
        self.gauges.running.fetch_add(1, Ordering::Relaxed);
        match job {
            Job::RunStage { album_id, stage } => self.run_stage(album_id, stage),
            Job::Search { person_id } => {
                if let Err(e) = self.run_search(person_id) {
                    error!("similarity search for person {} failed: {}", person_id, e);
                }
            }
        }
        self.gauges.running.fetch_sub(1, Ordering::Relaxed);
    }

    fn run_stage(&self, album_id: i64, stage: Stage) {
        let outcome = match stage {
            Stage::FaceSearch => face_search::run(&self.ctx, album_id),
            Stage::BuildPatterns => patterns::build(&self.ctx, album_id),
            Stage::Reconcile => reconcile::run(&self.ctx, album_id),
            Stage::Commit => persist::commit(&self.ctx, album_id),
            other => Err(RecognitionError::InvariantViolation(format!("stage {} does not run in the background", other))),
        };
        match outcome {
            Ok(next) => {
                debug!("album {}: stage {} done, next {:?}", album_id, stage, next);
                if let Err(e) = self.advance(album_id, next) {
                    error!("album {}: could not move on from stage {}: {}", album_id, stage, e);
                }
            }
            Err(e) => {
                self.release_album(album_id);
                error!("album {}: stage {} failed and stays in processing: {}", album_id, stage, e);
            }
        }
    }

    // -- similarity search --------------------------------------------------

    /// Launch a search for people resembling `person_id`, or report the one
    /// already running or finished.
    pub fn search(&self, person_id: i64) -> RecognitionResult<SearchStatus> {
        let total = self.search_total(person_id)?;
        if let Some(status) = self.search_progress(person_id, total)? {
            return Ok(status);
        }
        if !self.searches.lock().insert(person_id) {
            return Ok(self
                .search_progress(person_id, total)?
                .unwrap_or(SearchStatus::InProgress { processed: 0, total }));
        }
        if let Err(e) = self.ctx.staging.set(&keys::processed_patterns(person_id), b"0") {
            self.searches.lock().remove(&person_id);
            return Err(e.into());
        }
        match &self.queue {
            Some(_) => self.dispatch(Job::Search { person_id })?,
            None => {
                self.run_search(person_id)?;
            }
        }
        Ok(self
            .search_progress(person_id, total)?
            .unwrap_or(SearchStatus::InProgress { processed: 0, total }))
    }

    fn search_total(&self, person_id: i64) -> RecognitionResult<usize> {
        if self.ctx.read_db(|c| query::person_owner(c, person_id))?.is_none() {
            return Err(RecognitionError::NotFound(format!("person {}", person_id)));
        }
        Ok(self.ctx.read_db(|c| query::person_pattern_ids(c, person_id))?.len())
    }

    fn search_progress(&self, person_id: i64, total: usize) -> RecognitionResult<Option<SearchStatus>> {
        let staging = self.ctx.staging.as_ref();
        let processed = staging.get_i64(&keys::processed_patterns(person_id))?;
        if self.searches.lock().contains(&person_id) {
            return Ok(Some(SearchStatus::InProgress { processed: processed.unwrap_or(0), total }));
        }
        match processed {
            Some(n) if n >= total as i64 => {
                let key = keys::nearest_people(person_id);
                let people = staging
                    .lrange(&key)?
                    .into_iter()
                    .map(|v| {
                        let s = String::from_utf8_lossy(&v).into_owned();
                        s.parse::<i64>().map_err(|_| StagingError::Malformed {
                            key: key.clone(),
                            field: String::new(),
                            message: format!("not a person id: {:?}", s),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(SearchStatus::Done { people }))
            }
            _ => Ok(None),
        }
    }

    /// Caller holds the person's search claim; it is released here.
    fn run_search(&self, person_id: i64) -> RecognitionResult<Vec<i64>> {
        let result = self.nearest_people(person_id);
        self.searches.lock().remove(&person_id);
        result
    }

    fn nearest_people(&self, person_id: i64) -> RecognitionResult<Vec<i64>> {
        let person = self
            .ctx
            .read_db(|c| query::get_person(c, person_id))?
            .ok_or_else(|| RecognitionError::NotFound(format!("person {}", person_id)))?;
        let staging = self.ctx.staging.as_ref();
        let processed_key = keys::processed_patterns(person_id);
        let results_key = keys::nearest_people(person_id);
        let beam = self.ctx.settings.search_beam_width();

        let mut ranking = PeopleRanking::new(person.owner_id, person_id);
        for pattern in &person.patterns {
            if let Some(face) = pattern.central_face() {
                self.ctx.index.read(|tree| ranking.add_pattern(tree, &face.encoding, beam))?;
            }
            staging.incr_by(&processed_key, 1)?;
        }
        let hits = ranking.finish(self.ctx.settings.search_people_limit);

        staging.delete(&results_key)?;
        for hit in &hits {
            staging.rpush(&results_key, hit.person_id.to_string().as_bytes())?;
        }
        info!("person {}: {} similar people found", person_id, hits.len());
        Ok(hits.into_iter().map(|h| h.person_id).collect())
    }

    // -- durable deletions --------------------------------------------------

    pub fn delete_person(&self, person_id: i64) -> RecognitionResult<()> {
        cascade::delete_person(&self.ctx, person_id)
    }

    pub fn delete_pattern(&self, pattern_id: i64) -> RecognitionResult<()> {
        cascade::delete_pattern(&self.ctx, pattern_id)
    }

    pub fn delete_face(&self, face_id: i64) -> RecognitionResult<()> {
        cascade::delete_face(&self.ctx, face_id)
    }

    pub fn delete_photo(&self, photo_id: i64) -> RecognitionResult<usize> {
        cascade::delete_photo(&self.ctx, photo_id)
    }

    pub fn set_photo_private(&self, photo_id: i64, private: bool) -> RecognitionResult<usize> {
        cascade::set_photo_private(&self.ctx, photo_id, private)
    }
}

/// Fan jobs out round-robin to `n` workers. Handlers are blocking, so each
/// runs on the blocking pool.
pub async fn start_workers(n: usize, mut rx: mpsc::Receiver<Job>, recognizer: Recognizer) {
    let mut worker_txs = Vec::new();
    let mut worker_rxs = Vec::new();
    for _ in 0..n.max(1) {
        let (wt, wr) = mpsc::channel::<Job>(1000);
        worker_txs.push(wt);
        worker_rxs.push(wr);
    }

    tokio::spawn(async move {
        let mut idx = 0;
        while let Some(job) = rx.recv().await {
            let target_idx = idx % worker_txs.len();
            if worker_txs[target_idx].send(job).await.is_err() {
                break;
            }
            idx += 1;
        }
    });

    for mut worker_rx in worker_rxs {
        let recognizer = recognizer.clone();
        tokio::spawn(async move {
            while let Some(job) = worker_rx.recv().await {
                recognizer.gauges.queued.fetch_sub(1, Ordering::Relaxed);
                let runner = recognizer.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || runner.run_job(job)).await {
                    error!("recognition job {:?} panicked: {}", job, e);
                    recognizer.release_job(job);
                }
            }
        });
    }
    info!("started {} recognition workers", n.max(1));
}
