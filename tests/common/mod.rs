//! Fakes and fixture server shared by the end-to-end suites
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use media_scan::{BatchRequest, JobSpec, MediaKind, PipelineConfig};
use media_scan_common::VideoMetadata;
use media_scan_dispatcher::{Classifier, ClassifierError, UnitOutcome};
use media_scan_frames::{
    ExtractedFrame, FilterSpec, FrameTool, FrameToolError, LumaSample, LumaSampling, SeekSpec,
};
use media_scan_ingestion::{MediaInspector, ProbeError};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scores assigned to the three distinct scenes of every fake video
pub const SCENE_SCORES: [f32; 3] = [0.1, 0.2, 0.9];

/// Job id of a video's source file, `{round}/videos/{job_id}/source.ext`
pub fn job_of(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reports fixed metadata, with per-job overrides
pub struct FixedInspector {
    pub default: VideoMetadata,
    pub overrides: HashMap<String, VideoMetadata>,
    pub calls: AtomicUsize,
}

impl FixedInspector {
    pub fn new() -> Self {
        Self {
            default: VideoMetadata {
                duration_secs: 240.0,
                width: 1280,
                height: 720,
                fps: 29.97,
                codec: Some("h264".into()),
                container: Some("mov,mp4,m4a,3gp,3g2,mj2".into()),
                size_bytes: 0,
            },
            overrides: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_duration(mut self, job_id: &str, duration_secs: f64) -> Self {
        let metadata = VideoMetadata {
            duration_secs,
            ..self.default.clone()
        };
        self.overrides.insert(job_id.to_string(), metadata);
        self
    }
}

#[async_trait]
impl MediaInspector for FixedInspector {
    async fn inspect(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let job = job_of(path);
        Ok(self
            .overrides
            .get(&job)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

/// Writes frames for a video made of three visually distinct scenes
///
/// The scene strategy finds one frame per scene; the uniform strategy samples
/// each scene twice. Frame contents are `{job_id}|scene-{k}`, so identical
/// scenes hash the same across strategies.
#[derive(Default)]
pub struct ScriptedTool {
    pub jobs: Mutex<Vec<String>>,
    pub filter_calls: AtomicUsize,
}

impl ScriptedTool {
    pub fn calls_for(&self, job_id: &str) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.as_str() == job_id)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl FrameTool for ScriptedTool {
    async fn run_filter(&self, spec: &FilterSpec) -> Result<Vec<ExtractedFrame>, FrameToolError> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        let job = job_of(&spec.input);
        self.jobs.lock().unwrap().push(job.clone());

        let scenes: Vec<usize> = if spec.filter.starts_with("select=") {
            vec![0, 1, 2]
        } else {
            vec![0, 0, 1, 1, 2, 2]
        };

        std::fs::create_dir_all(&spec.output_dir)?;
        let mut frames = Vec::with_capacity(scenes.len());
        for (i, scene) in scenes.into_iter().enumerate() {
            let path = spec.output_dir.join(format!("frame_{:04}.jpg", i + 1));
            std::fs::write(&path, format!("{job}|scene-{scene}"))?;
            frames.push(ExtractedFrame {
                path,
                timestamp_secs: Some(scene as f64 * 80.0 + i as f64),
            });
        }
        Ok(frames)
    }

    async fn extract_at(&self, spec: &SeekSpec) -> Result<bool, FrameToolError> {
        self.jobs.lock().unwrap().push(job_of(&spec.input));
        Ok(false)
    }

    async fn luma_deltas(
        &self,
        input: &Path,
        _sampling: &LumaSampling,
    ) -> Result<Vec<LumaSample>, FrameToolError> {
        self.jobs.lock().unwrap().push(job_of(input));
        Ok(Vec::new())
    }
}

/// Scores frames by scene; every call carrying a poisoned job fails transiently
pub struct SceneClassifier {
    pub poisoned_job: Option<String>,
    pub calls: AtomicUsize,
}

impl SceneClassifier {
    pub fn new(poisoned_job: Option<&str>) -> Self {
        Self {
            poisoned_job: poisoned_job.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Classifier for SceneClassifier {
    async fn classify(&self, images: Vec<Bytes>) -> Result<Vec<UnitOutcome>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let texts: Vec<String> = images
            .iter()
            .map(|img| String::from_utf8_lossy(img).into_owned())
            .collect();

        if let Some(poisoned) = &self.poisoned_job {
            let prefix = format!("{poisoned}|");
            if texts.iter().any(|text| text.starts_with(&prefix)) {
                return Err(ClassifierError::Transient("CUDA out of memory".into()));
            }
        }

        Ok(texts
            .iter()
            .map(|text| {
                let score = text
                    .rsplit("scene-")
                    .next()
                    .and_then(|k| k.parse::<usize>().ok())
                    .and_then(|k| SCENE_SCORES.get(k).copied())
                    // Real image bytes (image jobs) score low
                    .unwrap_or(0.05);
                UnitOutcome::Scored {
                    nsfw_score: score,
                    probs: BTreeMap::from([
                        ("nsfw".to_string(), score),
                        ("normal".to_string(), 1.0 - score),
                    ]),
                }
            })
            .collect())
    }
}

/// Noisy JPEG so the encoded size stays close to the pixel count
pub fn noisy_jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    let img = image::RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        image::Rgb([r, g, b])
    });
    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 95);
    img.write_with_encoder(encoder).unwrap();
    out.into_inner()
}

pub fn mp4_bytes(len: usize) -> Vec<u8> {
    let mut data = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00isomiso2avc1mp41".to_vec();
    data.resize(len, 0);
    data
}

/// Chunked video body with no Content-Length, `chunks` x 64 KiB
async fn oversized_video(chunks: usize) -> Response {
    let first = mp4_bytes(64 * 1024);
    let body = std::iter::once(Ok::<_, std::io::Error>(Bytes::from(first)))
        .chain((1..chunks).map(|_| Ok(Bytes::from(vec![0u8; 64 * 1024]))));
    Body::from_stream(futures::stream::iter(body)).into_response()
}

/// Serves `/big.jpg` (about 2 MB), `/video.mp4`, `/huge.mp4` (1 MiB, chunked) and `/gone.mp4` (404)
pub async fn serve_fixtures() -> SocketAddr {
    let big = Bytes::from(noisy_jpeg(1200, 900));
    let app = Router::new()
        .route(
            "/big.jpg",
            get(move || {
                let big = big.clone();
                async move { big }
            }),
        )
        .route("/video.mp4", get(|| async { mp4_bytes(32 * 1024) }))
        .route("/huge.mp4", get(|| oversized_video(16)))
        .route("/gone.mp4", get(|| async { StatusCode::NOT_FOUND }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.workspace_root = root.to_path_buf();
    config.dispatcher.linger_ms = 5;
    config.dispatcher.retry.initial_backoff_ms = 1;
    config.dispatcher.retry.max_backoff_ms = 2;
    config
}

pub fn request(kind: MediaKind, jobs: &[(String, String)]) -> BatchRequest {
    BatchRequest {
        kind,
        jobs: jobs
            .iter()
            .map(|(job_id, url)| JobSpec {
                job_id: job_id.clone(),
                url: url.clone(),
            })
            .collect(),
    }
}

/// Every file left anywhere under `root`
pub fn remaining_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            found.push(path);
        }
    }
    found
}
