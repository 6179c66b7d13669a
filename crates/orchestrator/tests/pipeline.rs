//! Pipeline tests over a local HTTP server with fake capabilities

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use media_scan_common::{
    BatchRequest, ErrorKind, JobResult, JobSpec, JobStatus, MediaKind, PipelineConfig,
    VideoMetadata,
};
use media_scan_dispatcher::{Classifier, ClassifierError, UnitOutcome};
use media_scan_frames::{
    ExtractedFrame, FilterSpec, FrameTool, FrameToolError, LumaSample, LumaSampling, SeekSpec,
};
use media_scan_ingestion::{MediaInspector, ProbeError};
use futures::StreamExt;
use media_scan_orchestrator::{handle_event, Pipeline};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct FixedClassifier {
    score: f32,
    calls: AtomicUsize,
}

impl FixedClassifier {
    fn new(score: f32) -> Arc<Self> {
        Arc::new(Self {
            score,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, images: Vec<Bytes>) -> Result<Vec<UnitOutcome>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(images
            .iter()
            .map(|_| UnitOutcome::Scored {
                nsfw_score: self.score,
                probs: BTreeMap::from([
                    ("nsfw".to_string(), self.score),
                    ("normal".to_string(), 1.0 - self.score),
                ]),
            })
            .collect())
    }
}

/// Holds every call for `delay`, then records which files exist under `root`
struct SnapshotClassifier {
    root: PathBuf,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl SnapshotClassifier {
    fn new(root: &Path, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Classifier for SnapshotClassifier {
    async fn classify(&self, images: Vec<Bytes>) -> Result<Vec<UnitOutcome>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        *self.seen.lock().unwrap() = file_names(&self.root);
        Ok(images
            .iter()
            .map(|_| UnitOutcome::Scored {
                nsfw_score: 0.1,
                probs: BTreeMap::from([("nsfw".to_string(), 0.1)]),
            })
            .collect())
    }
}

struct SlowInspector;

#[async_trait]
impl MediaInspector for SlowInspector {
    async fn inspect(&self, _path: &Path) -> Result<VideoMetadata, ProbeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ProbeError::Tool("unreachable".into()))
    }
}

/// A frame tool that must never be reached
#[derive(Default)]
struct UnusedTool {
    calls: AtomicUsize,
}

#[async_trait]
impl FrameTool for UnusedTool {
    async fn run_filter(&self, _spec: &FilterSpec) -> Result<Vec<ExtractedFrame>, FrameToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn extract_at(&self, _spec: &SeekSpec) -> Result<bool, FrameToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn luma_deltas(
        &self,
        _input: &Path,
        _sampling: &LumaSampling,
    ) -> Result<Vec<LumaSample>, FrameToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

struct QuickInspector;

#[async_trait]
impl MediaInspector for QuickInspector {
    async fn inspect(&self, _path: &Path) -> Result<VideoMetadata, ProbeError> {
        Ok(VideoMetadata {
            duration_secs: 12.0,
            width: 640,
            height: 360,
            fps: 25.0,
            codec: Some("h264".into()),
            container: Some("mov,mp4,m4a,3gp,3g2,mj2".into()),
            size_bytes: 8192,
        })
    }
}

/// Writes one frame per filter, then hangs like a wedged ffmpeg
#[derive(Default)]
struct HangingTool {
    calls: AtomicUsize,
}

#[async_trait]
impl FrameTool for HangingTool {
    async fn run_filter(&self, spec: &FilterSpec) -> Result<Vec<ExtractedFrame>, FrameToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(&spec.output_dir)?;
        std::fs::write(spec.output_dir.join("frame_0001.jpg"), b"partial")?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }

    async fn extract_at(&self, _spec: &SeekSpec) -> Result<bool, FrameToolError> {
        Ok(false)
    }

    async fn luma_deltas(
        &self,
        _input: &Path,
        _sampling: &LumaSampling,
    ) -> Result<Vec<LumaSample>, FrameToolError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 120, 40]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

fn mp4_bytes() -> Vec<u8> {
    let mut data = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00isomiso2avc1mp41".to_vec();
    data.resize(8192, 0);
    data
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/cat.jpg", get(|| async { jpeg_bytes(64, 48) }))
        .route("/dog.jpg", get(|| async { jpeg_bytes(32, 32) }))
        .route("/clip.mp4", get(|| async { mp4_bytes() }))
        .route("/gone.jpg", get(|| async { StatusCode::NOT_FOUND }))
        .route("/stall.jpg", get(|| async { stalled_body() }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Sends the start of a JPEG, then never finishes the body
fn stalled_body() -> axum::response::Response {
    let jpeg = jpeg_bytes(64, 48);
    let head = Bytes::copy_from_slice(&jpeg[..jpeg.len() / 2]);
    let body = futures::stream::iter([Ok::<_, std::io::Error>(head)]).chain(futures::stream::pending());
    Body::from_stream(body).into_response()
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.workspace_root = root.to_path_buf();
    config.dispatcher.linger_ms = 5;
    config.dispatcher.retry.initial_backoff_ms = 1;
    config.dispatcher.retry.max_backoff_ms = 2;
    config
}

fn request(kind: MediaKind, jobs: &[(&str, String)]) -> BatchRequest {
    BatchRequest {
        kind,
        jobs: jobs
            .iter()
            .map(|(job_id, url)| JobSpec {
                job_id: job_id.to_string(),
                url: url.clone(),
            })
            .collect(),
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

/// Names of every file and directory under `root`
fn file_names(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            names.push(entry.file_name().to_string_lossy().into_owned());
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    names
}

#[tokio::test]
async fn test_image_batch_reports_dimensions_and_cleans_up() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let classifier = FixedClassifier::new(0.1);
    let pipeline = Pipeline::builder(config(root.path()))
        .classifier(classifier.clone())
        .build()
        .unwrap();

    let response = pipeline
        .run_batch(request(
            MediaKind::Images,
            &[
                ("cat", format!("http://{addr}/cat.jpg")),
                ("dog", format!("http://{addr}/dog.jpg")),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.kind, MediaKind::Images);
    assert_eq!(response.total_frames, 2);
    assert_eq!(response.engine_version, "scan-engine-v1");
    let cat = &response.results["cat"];
    assert_eq!(cat.status, JobStatus::Done);
    let Some(JobResult::Image(image)) = &cat.result else {
        panic!("expected an image result, got {cat:?}");
    };
    assert_eq!((image.width, image.height), (64, 48));
    assert_eq!(image.filename, "cat.jpg");
    assert_eq!(
        image.relative_path,
        format!("{}/images/cat.jpg", response.round_id)
    );
    assert_eq!(image.is_nsfw, Some(false));

    assert!(classifier.calls.load(Ordering::SeqCst) >= 1);
    assert!(is_empty_dir(root.path()));
}

#[tokio::test]
async fn test_failed_download_does_not_affect_siblings() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::builder(config(root.path()))
        .classifier(FixedClassifier::new(0.9))
        .build()
        .unwrap();

    let response = pipeline
        .run_batch(request(
            MediaKind::Images,
            &[
                ("ok", format!("http://{addr}/cat.jpg")),
                ("missing", format!("http://{addr}/gone.jpg")),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.results.len(), 2);
    let missing = &response.results["missing"];
    assert_eq!(missing.status, JobStatus::Failed);
    assert_eq!(
        missing.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::DownloadError)
    );
    assert!(missing.result.is_none());

    let ok = &response.results["ok"];
    assert_eq!(ok.status, JobStatus::Done);
    assert_eq!(ok.result.as_ref().map(JobResult::frame_count), Some(1));
    assert!(is_empty_dir(root.path()));
}

#[tokio::test]
async fn test_probe_timeout_fails_job_without_extraction() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let mut config = config(root.path());
    config.timeouts.probe_secs = 1;
    let tool = Arc::new(UnusedTool::default());
    let pipeline = Pipeline::builder(config)
        .classifier(FixedClassifier::new(0.1))
        .inspector(Arc::new(SlowInspector))
        .frame_tool(tool.clone())
        .build()
        .unwrap();

    let response = pipeline
        .run_batch(request(
            MediaKind::Videos,
            &[("slow", format!("http://{addr}/clip.mp4"))],
        ))
        .await
        .unwrap();

    let slow = &response.results["slow"];
    let error = slow.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::TimeoutError);
    assert!(error.message.contains("probe"));
    assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    assert!(is_empty_dir(root.path()));
}

#[tokio::test]
async fn test_handle_event_envelopes() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::builder(config(root.path()))
        .classifier(FixedClassifier::new(0.7))
        .build()
        .unwrap();

    let ok = handle_event(
        &pipeline,
        json!({"type": "images", "jobs": [{"job_id": "a", "url": format!("http://{addr}/cat.jpg")}]}),
    )
    .await;
    assert_eq!(ok["status"], "success");
    assert_eq!(ok["results"]["type"], "images");
    assert_eq!(ok["results"]["results"]["a"]["status"], "done");
    assert_eq!(ok["results"]["results"]["a"]["result"]["media_type"], "image");
    assert_eq!(ok["results"]["results"]["a"]["result"]["verdict"], "nsfw");

    let duplicate = handle_event(
        &pipeline,
        json!({"type": "images", "jobs": [
            {"job_id": "a", "url": format!("http://{addr}/cat.jpg")},
            {"job_id": "a", "url": format!("http://{addr}/dog.jpg")}
        ]}),
    )
    .await;
    assert_eq!(duplicate["status"], "error");
    assert!(duplicate["message"].as_str().unwrap().contains("Invalid request"));

    let bad_type = handle_event(&pipeline, json!({"type": "audio", "jobs": []})).await;
    assert_eq!(bad_type["status"], "error");

    assert!(is_empty_dir(root.path()));
}

#[tokio::test]
async fn test_too_many_video_jobs_rejected_before_io() {
    let root = tempfile::tempdir().unwrap();
    let classifier = FixedClassifier::new(0.1);
    let pipeline = Pipeline::builder(config(root.path()))
        .classifier(classifier.clone())
        .build()
        .unwrap();

    let jobs: Vec<(String, String)> = (0..11)
        .map(|i| (format!("v{i}"), format!("http://127.0.0.1:9/{i}.mp4")))
        .collect();
    let jobs: Vec<(&str, String)> = jobs.iter().map(|(id, url)| (id.as_str(), url.clone())).collect();

    let err = pipeline
        .run_batch(request(MediaKind::Videos, &jobs))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalError);
    assert!(is_empty_dir(root.path()));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_extraction_timeout_fails_job_and_removes_frames() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let mut config = config(root.path());
    config.timeouts.extraction_secs = 1;
    let tool = Arc::new(HangingTool::default());
    let pipeline = Pipeline::builder(config)
        .classifier(FixedClassifier::new(0.1))
        .inspector(Arc::new(QuickInspector))
        .frame_tool(tool.clone())
        .build()
        .unwrap();

    let started = Instant::now();
    let response = pipeline
        .run_batch(request(
            MediaKind::Videos,
            &[("wedged", format!("http://{addr}/clip.mp4"))],
        ))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    let wedged = &response.results["wedged"];
    assert_eq!(wedged.status, JobStatus::Failed);
    let error = wedged.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::TimeoutError);
    assert!(error.message.contains("extraction"));
    assert!(tool.calls.load(Ordering::SeqCst) >= 1);
    assert!(is_empty_dir(root.path()));
}

#[tokio::test]
async fn test_stalled_download_times_out_and_drops_partial_file() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let mut config = config(root.path());
    config.timeouts.download_secs = 1;
    // The sibling's scan looks at the workspace after the stalled job gave up
    let classifier = SnapshotClassifier::new(root.path(), Duration::from_millis(1500));
    let pipeline = Pipeline::builder(config)
        .classifier(classifier.clone())
        .build()
        .unwrap();

    let response = pipeline
        .run_batch(request(
            MediaKind::Images,
            &[
                ("stalled", format!("http://{addr}/stall.jpg")),
                ("cat", format!("http://{addr}/cat.jpg")),
            ],
        ))
        .await
        .unwrap();

    let stalled = &response.results["stalled"];
    let error = stalled.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::TimeoutError);
    assert!(error.message.contains("download"));
    assert_eq!(response.results["cat"].status, JobStatus::Done);

    let seen = classifier.seen.lock().unwrap().clone();
    assert!(seen.contains(&"cat.jpg".to_string()), "{seen:?}");
    assert!(!seen.iter().any(|name| name.starts_with("stalled.")), "{seen:?}");
    assert!(is_empty_dir(root.path()));
}

#[tokio::test]
async fn test_batch_deadline_cancels_outstanding_scans() {
    let addr = serve().await;
    let root = tempfile::tempdir().unwrap();
    let mut config = config(root.path());
    config.timeouts.batch_secs = 1;
    config.dispatcher.max_batch_size = 1;
    config.dispatcher.max_in_flight = 1;
    let classifier = SnapshotClassifier::new(root.path(), Duration::from_secs(2));
    let pipeline = Pipeline::builder(config)
        .classifier(classifier.clone())
        .build()
        .unwrap();

    let jobs: Vec<(String, String)> = (0..6)
        .map(|i| (format!("img{i}"), format!("http://{addr}/cat.jpg")))
        .collect();
    let jobs: Vec<(&str, String)> = jobs.iter().map(|(id, url)| (id.as_str(), url.clone())).collect();

    let started = Instant::now();
    let response = pipeline
        .run_batch(request(MediaKind::Images, &jobs))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Six serial 2s classifier calls would take 12s
    assert!(elapsed < Duration::from_secs(4), "batch took {elapsed:?}");
    assert_eq!(response.results.len(), 6);
    for outcome in response.results.values() {
        let error = outcome.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::TimeoutError);
        assert!(error.message.contains("batch"));
    }
    assert!(classifier.calls.load(Ordering::SeqCst) <= 1);
    assert!(is_empty_dir(root.path()));
}
