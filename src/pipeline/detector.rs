use anyhow::Result;
use serde::Deserialize;

use crate::models::{Bbox, DetectedFace, Embedding};

/// Produces face boxes and encodings for one image. Output order must be
/// stable for identical input.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>>;
}

impl std::fmt::Debug for dyn FaceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaceDetector {{ ... }}")
    }
}

/// Detector used when no model is configured. Every album ends with no faces.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl FaceDetector for NullDetector {
    fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
        Ok(Vec::new())
    }
}

/// Wire shape of one detection: `{"location": [t, r, b, l], "encoding": [..128]}`.
#[derive(Debug, Deserialize)]
pub struct RawDetection {
    pub location: [i64; 4],
    pub encoding: Vec<f64>,
}

impl RawDetection {
    pub fn into_face(self) -> Result<DetectedFace> {
        Ok(DetectedFace {
            location: Bbox::from_raw(self.location)?,
            encoding: Embedding::new(self.encoding)?,
        })
    }
}

pub fn parse_detections(body: &[u8]) -> Result<Vec<DetectedFace>> {
    let raw: Vec<RawDetection> = serde_json::from_slice(body)?;
    raw.into_iter().map(RawDetection::into_face).collect()
}

#[cfg(feature = "remote-detector")]
pub use remote::RemoteDetector;

#[cfg(feature = "remote-detector")]
mod remote {
    use anyhow::{Context, Result};
    use std::time::Duration;
    use tracing::debug;

    use super::{parse_detections, FaceDetector};
    use crate::models::DetectedFace;

    /// Posts the raw image to an embedding service and reads back detections.
    pub struct RemoteDetector {
        url: String,
        client: reqwest::blocking::Client,
    }

    impl RemoteDetector {
        pub fn new(url: impl Into<String>) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .context("Failed to create HTTP client")?;
            Ok(Self { url: url.into(), client })
        }
    }

    impl FaceDetector for RemoteDetector {
        fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
            let response = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(image.to_vec())
                .send()
                .context(format!("Failed to reach face detector at {}", self.url))?;
            if !response.status().is_success() {
                anyhow::bail!("Face detector returned HTTP {}", response.status());
            }
            let body = response.bytes().context("Failed to read detector response")?;
            let faces = parse_detections(&body)?;
            debug!("detector returned {} faces", faces.len());
            Ok(faces)
        }
    }
}
