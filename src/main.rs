use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nazr_recognition::cluster::ClusterIndex;
use nazr_recognition::db;
use nazr_recognition::pipeline::detector::{FaceDetector, NullDetector};
use nazr_recognition::pipeline::{scheduler, Job, PipelineContext, Recognizer};
use nazr_recognition::staging::{MemoryStore, StagingStore};
use nazr_recognition::utils::config::Config;
use nazr_recognition::utils::logging;
use nazr_recognition::{AppPaths, AppState};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn detector(cfg: &Config) -> anyhow::Result<Arc<dyn FaceDetector>> {
    match &cfg.detector_url {
        #[cfg(feature = "remote-detector")]
        Some(url) => {
            info!("using face detector at {}", url);
            Ok(Arc::new(nazr_recognition::pipeline::detector::RemoteDetector::new(url.clone())?))
        }
        #[cfg(not(feature = "remote-detector"))]
        Some(url) => {
            warn!("NAZR_DETECTOR_URL={} ignored: built without remote-detector", url);
            Ok(Arc::new(NullDetector))
        }
        None => {
            warn!("no face detector configured; every album will finish with no faces");
            Ok(Arc::new(NullDetector))
        }
    }
}

fn memory_staging(ttl: Duration) -> Arc<dyn StagingStore> {
    let store = Arc::new(MemoryStore::new(ttl));
    let purged = store.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let n = purged.purge_expired();
            if n > 0 {
                info!("expired {} staging keys", n);
            }
        }
    });
    store
}

fn staging(cfg: &Config) -> anyhow::Result<Arc<dyn StagingStore>> {
    let ttl = Duration::from_secs(cfg.recognition.staging_ttl_secs);
    match &cfg.redis_url {
        #[cfg(feature = "redis-staging")]
        Some(url) => {
            info!("staging recognition data in redis at {}", url);
            Ok(Arc::new(nazr_recognition::staging::RedisStore::open(url, ttl)?))
        }
        #[cfg(not(feature = "redis-staging"))]
        Some(url) => {
            warn!("NAZR_REDIS_URL={} ignored: built without redis-staging", url);
            Ok(memory_staging(ttl))
        }
        None => {
            warn!("no redis configured; staging data is kept in process and lost on restart");
            Ok(memory_staging(ttl))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env();
    let paths = AppPaths::under(&cfg.data);
    if let Some(db_dir) = paths.db_path.parent() {
        std::fs::create_dir_all(db_dir)?;
    }
    std::fs::create_dir_all(&paths.temp)?;

    let conn = db::open_or_create(&paths.db_path)?;
    let index = ClusterIndex::load(&conn, &cfg.recognition)?;
    info!("cluster index loaded: {:?}", index);

    let staging = staging(&cfg)?;

    let ctx = PipelineContext {
        db: Arc::new(Mutex::new(conn)),
        staging,
        index: Arc::new(index),
        detector: detector(&cfg)?,
        settings: cfg.recognition.clone(),
        temp_root: paths.temp.clone(),
    };
    let (job_tx, job_rx) = mpsc::channel::<Job>(4_096);
    let recognizer = Recognizer::with_queue(ctx, job_tx);
    scheduler::start_workers(cfg.recognition_threads, job_rx, recognizer.clone()).await;

    let state = Arc::new(AppState::new(paths, recognizer));
    let app = nazr_recognition::api::routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
