use std::env;
use std::path::PathBuf;

/// Tunables of the recognition core. Names match the deployed settings module
/// so existing environments keep working.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionSettings {
    pub face_recognition_tolerance: f64,
    pub pattern_equality_tolerance: f64,
    pub cluster_limit: usize,
    pub unregistered_patterns_relevant_limit: f64,
    pub minimal_cluster_to_recalculate: usize,
    pub search_people_limit: usize,
    pub staging_ttl_secs: u64,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            face_recognition_tolerance: 0.6,
            pattern_equality_tolerance: 0.75,
            cluster_limit: 100,
            unregistered_patterns_relevant_limit: 0.25,
            minimal_cluster_to_recalculate: 8,
            search_people_limit: 20,
            staging_ttl_secs: 3600,
        }
    }
}

impl RecognitionSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            face_recognition_tolerance: env_parse("FACE_RECOGNITION_TOLERANCE", d.face_recognition_tolerance),
            pattern_equality_tolerance: env_parse("PATTERN_EQUALITY_TOLERANCE", d.pattern_equality_tolerance),
            cluster_limit: env_parse("CLUSTER_LIMIT", d.cluster_limit),
            unregistered_patterns_relevant_limit: env_parse(
                "UNREGISTERED_PATTERNS_CLUSTER_RELEVANT_LIMIT",
                d.unregistered_patterns_relevant_limit,
            ),
            minimal_cluster_to_recalculate: env_parse("MINIMAL_CLUSTER_TO_RECALCULATE", d.minimal_cluster_to_recalculate),
            search_people_limit: env_parse("SEARCH_PEOPLE_LIMIT", d.search_people_limit),
            staging_ttl_secs: env_parse("REDIS_DATA_EXPIRATION_SECONDS", d.staging_ttl_secs),
        }
    }

    /// Beam width of the similarity walk.
    pub fn search_beam_width(&self) -> usize {
        self.search_people_limit * 3
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data: PathBuf,
    pub port: u16,
    pub recognition_threads: usize,
    pub detector_url: Option<String>,
    pub redis_url: Option<String>,
    pub recognition: RecognitionSettings,
}

impl Config {
    pub fn from_env() -> Self {
        let data = env::var("NAZR_DATA").unwrap_or_else(|_| "/nazr-data".to_string());
        let port = env_parse("NAZR_PORT", 9162u16);
        let recognition_threads = env_parse("NAZR_RECOGNITION_THREADS", 2usize).max(1);
        let detector_url = env::var("NAZR_DETECTOR_URL").ok().filter(|v| !v.is_empty());
        let redis_url = env::var("NAZR_REDIS_URL").ok().filter(|v| !v.is_empty());
        Self {
            data: PathBuf::from(data),
            port,
            recognition_threads,
            detector_url,
            redis_url,
            recognition: RecognitionSettings::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "NAZR_DATA",
        "NAZR_PORT",
        "NAZR_RECOGNITION_THREADS",
        "NAZR_DETECTOR_URL",
        "NAZR_REDIS_URL",
        "FACE_RECOGNITION_TOLERANCE",
        "PATTERN_EQUALITY_TOLERANCE",
        "CLUSTER_LIMIT",
        "UNREGISTERED_PATTERNS_CLUSTER_RELEVANT_LIMIT",
        "MINIMAL_CLUSTER_TO_RECALCULATE",
        "SEARCH_PEOPLE_LIMIT",
        "REDIS_DATA_EXPIRATION_SECONDS",
    ];

    fn clear_vars(vars: &[&str]) -> Vec<(String, Option<String>)> {
        let mut saved = Vec::new();
        for &k in vars {
            let prev = env::var(k).ok();
            saved.push((k.to_string(), prev));
            env::remove_var(k);
        }
        saved
    }

    fn restore_vars(saved: Vec<(String, Option<String>)>) {
        for (k, v) in saved {
            if let Some(val) = v {
                env::set_var(k, val);
            } else {
                env::remove_var(k);
            }
        }
    }

    // Both cases share one test so they never race on the process environment.
    #[test]
    fn test_config_defaults_and_overrides() {
        let saved = clear_vars(VARS);

        let config = Config::from_env();
        assert_eq!(config.data, PathBuf::from("/nazr-data"));
        assert_eq!(config.port, 9162);
        assert_eq!(config.recognition_threads, 2);
        assert_eq!(config.detector_url, None);
        assert_eq!(config.redis_url, None);
        assert_eq!(config.recognition, RecognitionSettings::default());
        assert_eq!(config.recognition.search_beam_width(), 60);

        env::set_var("NAZR_DATA", "/custom/data");
        env::set_var("NAZR_PORT", "8080");
        env::set_var("NAZR_RECOGNITION_THREADS", "0");
        env::set_var("NAZR_DETECTOR_URL", "http://127.0.0.1:7000/detect");
        env::set_var("NAZR_REDIS_URL", "redis://cache:6379/2");
        env::set_var("FACE_RECOGNITION_TOLERANCE", "0.5");
        env::set_var("CLUSTER_LIMIT", "10");
        env::set_var("SEARCH_PEOPLE_LIMIT", "5");
        env::set_var("REDIS_DATA_EXPIRATION_SECONDS", "not-a-number");

        let config = Config::from_env();
        assert_eq!(config.data, PathBuf::from("/custom/data"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.recognition_threads, 1);
        assert_eq!(config.detector_url.as_deref(), Some("http://127.0.0.1:7000/detect"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379/2"));
        assert_eq!(config.recognition.face_recognition_tolerance, 0.5);
        assert_eq!(config.recognition.cluster_limit, 10);
        assert_eq!(config.recognition.search_beam_width(), 15);
        assert_eq!(config.recognition.staging_ttl_secs, 3600);

        restore_vars(saved);
    }
}
