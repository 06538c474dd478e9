//! Async front of the matting pipeline.
//!
//! Models and the session store are built once and shared through `Arc`.
//! Every blocking step runs on tokio's blocking pool, so status checks and
//! other sessions stay responsive while a request is being matted.

use crate::config::ServiceConfig;
use crate::error::{MattingError, MattingResult, Status};
use crate::matting::{MattingJob, MattingOptions, MattingOrchestrator, ProtocolVersion};
use crate::output::{persist, write_archive, ArtifactDir, MatteSink};
use crate::refiner::MattingRefiner;
use crate::session::{SessionMetadata, SessionStore};
use crate::tracking::{ObjectTracker, Sam2Tracker, TrackerConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Reply envelope of every service operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MattingResponse {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl MattingResponse {
    pub fn success(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            data,
        }
    }

    pub fn failure(err: &MattingError) -> Self {
        match err {
            MattingError::Model(_) | MattingError::Io { .. } | MattingError::Unexpected(_) => {
                tracing::error!("Request failed: {}", err);
            }
            _ => tracing::warn!("Request rejected: {}", err),
        }
        Self {
            status: err.status(),
            message: err.public_message(),
            data: None,
        }
    }

    fn from_result<T: Serialize>(result: MattingResult<T>, message: &str) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(data) => Self::success(message, Some(data)),
                Err(e) => Self::failure(&MattingError::unexpected(e)),
            },
            Err(e) => Self::failure(&e),
        }
    }
}

/// Matting request as sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MattingRequest {
    pub hash: String,
    pub points: Vec<[f32; 2]>,
    pub start: usize,
    pub finish: usize,
    /// Hard cutout below the segmentation threshold
    #[serde(default)]
    pub zero: bool,
    /// Coordinate convention; the deployment default when absent
    #[serde(default)]
    pub protocol: Option<ProtocolVersion>,
    /// Also store binary masks next to the mattes
    #[serde(default)]
    pub masks: bool,
    /// Emit mattes at the uploaded video's resolution instead of the working one
    #[serde(default)]
    pub native_output: bool,
    /// Run the refiner at the uploaded video's resolution
    #[serde(default)]
    pub native_refine: bool,
}

/// Where a finished request left its results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MattingReport {
    pub request_id: Uuid,
    pub frames: usize,
    pub archive: PathBuf,
    pub artifacts: PathBuf,
}

pub struct MattingService<T: ObjectTracker> {
    pipeline: Arc<MattingOrchestrator<T>>,
    store: Arc<SessionStore>,
    config: ServiceConfig,
}

impl<T: ObjectTracker> Clone for MattingService<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl MattingService<Sam2Tracker> {
    /// Load the tracker graphs and refiner weights named by `config`
    pub fn load(config: ServiceConfig) -> anyhow::Result<Self> {
        let mut tracker_config = TrackerConfig::new(&config.tracker_dir);
        tracker_config.intra_threads = config.intra_threads;
        let tracker = Sam2Tracker::new(tracker_config).context("Failed to load tracker")?;

        let refiner = MattingRefiner::from_path(&config.refiner_weights, config.refiner_mode)
            .with_context(|| {
                format!(
                    "Failed to load refiner from {}",
                    config.refiner_weights.display()
                )
            })?;

        Ok(Self::new(MattingOrchestrator::new(tracker, refiner), config))
    }
}

impl<T: ObjectTracker + 'static> MattingService<T> {
    pub fn new(pipeline: MattingOrchestrator<T>, config: ServiceConfig) -> Self {
        let store = SessionStore::new(&config.data_root, config.working_resolution);
        Self {
            pipeline: Arc::new(pipeline),
            store: Arc::new(store),
            config,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn ready(&self) -> MattingResponse {
        MattingResponse::success("Ready", None)
    }

    /// Store the decoded frames of an upload; repeated hashes are a no-op
    pub async fn upload(&self, hash: String, frames_dir: PathBuf, fps: f32) -> MattingResponse {
        let store = Arc::clone(&self.store);
        let result = blocking(move || store.ingest(&hash, &frames_dir, fps)).await;

        match result {
            Ok(ingested) => {
                let message = if ingested.created {
                    "Uploaded"
                } else {
                    "Already exists"
                };
                MattingResponse::from_result(Ok(ingested.metadata), message)
            }
            Err(e) => MattingResponse::failure(&e),
        }
    }

    pub async fn metadata(&self, hash: String) -> MattingResponse {
        let store = Arc::clone(&self.store);
        let result: MattingResult<SessionMetadata> = blocking(move || store.metadata(&hash)).await;
        MattingResponse::from_result(result, "Session found")
    }

    pub async fn matting(&self, request: MattingRequest, cancel: CancellationToken) -> MattingResponse {
        let result = self.run_matting(request, cancel).await;
        MattingResponse::from_result(result, "Matting finished")
    }

    /// Matte a frame window and package the mattes
    ///
    /// Runs on the blocking pool under the configured timeout. A failed
    /// request leaves no archive behind; frames already written to its
    /// artifact directory stay in place.
    pub async fn run_matting(
        &self,
        request: MattingRequest,
        cancel: CancellationToken,
    ) -> MattingResult<MattingReport> {
        let paths = self.store.new_request(&request.hash)?;
        tracing::info!(
            "Request {}: matting session {} frames {}..{} with {} points",
            paths.request_id,
            request.hash,
            request.start,
            request.finish,
            request.points.len()
        );

        let pipeline = Arc::clone(&self.pipeline);
        let store = Arc::clone(&self.store);
        let protocol = request.protocol.unwrap_or(self.config.protocol);
        let token = cancel.child_token();
        let worker_token = token.clone();
        let archive = paths.archive.clone();
        let artifacts = paths.dir.clone();

        let work = blocking(move || {
            let (metadata, frames) = store.frames(&request.hash)?;
            let options = MattingOptions {
                refine_resolution: request.native_refine.then(|| metadata.native()),
                output_resolution: request.native_output.then(|| metadata.native()),
                zero_mask: request.zero,
            };
            let job = MattingJob::prepare(
                &frames,
                metadata.native(),
                &request.points,
                protocol,
                request.start,
                request.finish,
                options,
            )?;

            let mut sink = ArtifactDir::create(&artifacts, request.masks)?;
            let stream = pipeline.run(&frames, &job, worker_token.clone())?;
            persist(stream, &mut sink)?;

            if worker_token.is_cancelled() {
                return Err(MattingError::Cancelled);
            }
            write_archive(&sink.matte_dir(), &archive)?;
            if worker_token.is_cancelled() {
                remove_archive(&archive);
                return Err(MattingError::Cancelled);
            }
            Ok(sink.written())
        });

        let timeout = self.config.request_timeout;
        let result = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(MattingError::Timeout(timeout.as_secs()))
            }
        };

        match result {
            Ok(frames) => {
                tracing::info!(
                    "Request {}: matted {} frames into {}",
                    paths.request_id,
                    frames,
                    paths.archive.display()
                );
                Ok(MattingReport {
                    request_id: paths.request_id,
                    frames,
                    archive: paths.archive,
                    artifacts: paths.dir,
                })
            }
            Err(e) => {
                remove_archive(&paths.archive);
                Err(e)
            }
        }
    }
}

/// Run blocking work off the async workers
async fn blocking<R, F>(f: F) -> MattingResult<R>
where
    F: FnOnce() -> MattingResult<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MattingError::unexpected(format!("worker task failed: {e}")))?
}

fn remove_archive(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed archive {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove archive {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameSource;
    use crate::refiner::testing::tiny_weights;
    use crate::refiner::OutputMode;
    use crate::tracking::testing::{FakeState, FakeTracker, FAKE_FEATURE_CHANNELS};
    use crate::tracking::{PromptPoint, TrackOutput};
    use image::RgbImage;
    use std::fs::File;
    use std::time::Duration;

    const WORKING: (u32, u32) = (32, 16);

    fn config(root: &Path) -> ServiceConfig {
        ServiceConfig {
            data_root: root.to_path_buf(),
            working_resolution: WORKING,
            ..Default::default()
        }
    }

    fn refiner() -> MattingRefiner {
        MattingRefiner::from_weights(&tiny_weights(FAKE_FEATURE_CHANNELS, 0.2), OutputMode::Probability)
            .unwrap()
    }

    fn service<T: ObjectTracker + 'static>(root: &Path, tracker: T) -> MattingService<T> {
        MattingService::new(MattingOrchestrator::new(tracker, refiner()), config(root))
    }

    fn upload_source(count: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            let frame = RgbImage::from_fn(64, 32, |x, _| image::Rgb([(x * 4) as u8, (i * 20) as u8, 90]));
            frame.save(dir.path().join(format!("{i:04}.png"))).unwrap();
        }
        dir
    }

    fn request(hash: &str, start: usize, finish: usize) -> MattingRequest {
        MattingRequest {
            hash: hash.to_string(),
            points: vec![[0.4, 0.5], [0.6, 0.5]],
            start,
            finish,
            zero: false,
            protocol: None,
            masks: false,
            native_output: false,
            native_refine: false,
        }
    }

    #[tokio::test]
    async fn ten_frame_session_window_two_to_five() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(10);
        let service = service(root.path(), FakeTracker::default());

        let uploaded = service.upload("clip".into(), source.path().to_path_buf(), 25.0).await;
        assert_eq!(uploaded.status, Status::Success);

        let report = service
            .run_matting(request("clip", 2, 5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.frames, 3);

        let mut zip = zip::ZipArchive::new(File::open(&report.archive).unwrap()).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["00002.png", "00003.png", "00004.png"]);

        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut zip.by_name("00003.png").unwrap(), &mut bytes).unwrap();
        let matte = image::load_from_memory(&bytes).unwrap();
        assert_eq!(matte.color(), image::ColorType::L8);
        assert_eq!((matte.width(), matte.height()), WORKING);
    }

    #[tokio::test]
    async fn native_output_and_masks() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(3);
        let service = service(root.path(), FakeTracker::default());
        service.upload("clip".into(), source.path().to_path_buf(), 25.0).await;

        let mut req = request("clip", 0, 3);
        req.native_output = true;
        req.native_refine = true;
        req.masks = true;
        req.zero = true;
        let report = service.run_matting(req, CancellationToken::new()).await.unwrap();

        let matte = image::open(report.artifacts.join("matte/00001.png")).unwrap();
        assert_eq!((matte.width(), matte.height()), (64, 32));
        assert!(report.artifacts.join("mask/00001.png").is_file());
    }

    #[tokio::test]
    async fn reupload_returns_cached_metadata() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(2);
        let service = service(root.path(), FakeTracker::default());

        let first = service.upload("dup".into(), source.path().to_path_buf(), 30.0).await;
        let second = service.upload("dup".into(), source.path().to_path_buf(), 30.0).await;

        assert_eq!(first.message, "Uploaded");
        assert_eq!(second.message, "Already exists");
        assert_eq!(first.data, second.data);

        let info = service.metadata("dup".into()).await;
        assert_eq!(info.data, first.data);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), FakeTracker::default());

        let response = service.metadata("nothing".into()).await;
        assert_eq!(response.status, Status::NotFound);

        let response = service
            .matting(request("nothing", 0, 1), CancellationToken::new())
            .await;
        assert_eq!(response.status, Status::NotFound);
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn invalid_request_fails_before_any_work() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(4);
        let service = service(root.path(), FakeTracker::default());
        service.upload("clip".into(), source.path().to_path_buf(), 25.0).await;

        let response = service
            .matting(request("clip", 1, 9), CancellationToken::new())
            .await;
        assert_eq!(response.status, Status::Fail);
        assert!(response.data.is_none());

        let mut req = request("clip", 0, 2);
        req.points = vec![[1.5, 0.5]];
        let err = service.run_matting(req, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MattingError::Validation(_)));

        // only frames/ and params.json in the session
        let entries = std::fs::read_dir(root.path().join("clip")).unwrap().count();
        assert_eq!(entries, 2);
        assert_eq!(service.pipeline.tracker().seeds(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_leaves_no_archive() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(4);
        let service = service(root.path(), FakeTracker::default());
        service.upload("clip".into(), source.path().to_path_buf(), 25.0).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service.run_matting(request("clip", 0, 4), cancel).await.unwrap_err();
        assert!(matches!(err, MattingError::Cancelled));

        let archives = std::fs::read_dir(root.path().join("clip"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "zip"))
            .count();
        assert_eq!(archives, 0);
    }

    /// Tracker that takes far longer than the request timeout per frame
    struct SlowTracker(FakeTracker);

    impl ObjectTracker for SlowTracker {
        type State = FakeState;

        fn seed(&self, frame: &RgbImage, points: &[PromptPoint]) -> MattingResult<(FakeState, TrackOutput)> {
            self.0.seed(frame, points)
        }

        fn propagate(&self, state: &mut FakeState, frame: &RgbImage) -> MattingResult<TrackOutput> {
            std::thread::sleep(Duration::from_millis(200));
            self.0.propagate(state, frame)
        }
    }

    #[tokio::test]
    async fn slow_requests_time_out_and_stop() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(6);
        let mut service = service(root.path(), SlowTracker(FakeTracker::default()));
        service.config.request_timeout = Duration::from_millis(50);
        service.upload("clip".into(), source.path().to_path_buf(), 25.0).await;

        let response = service
            .matting(request("clip", 0, 6), CancellationToken::new())
            .await;
        assert_eq!(response.status, Status::Fail);
        assert!(response.message.contains("timed out"));

        // the worker notices the cancellation after its current frame
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(service.pipeline.tracker().0.propagations() < 5);
    }

    #[tokio::test]
    async fn stored_frames_match_working_resolution() {
        let root = tempfile::tempdir().unwrap();
        let source = upload_source(1);
        let service = service(root.path(), FakeTracker::default());
        service.upload("one".into(), source.path().to_path_buf(), 25.0).await;

        let (metadata, frames) = service.store().frames("one").unwrap();
        assert_eq!(metadata.native(), (64, 32));
        assert_eq!(frames.frame(0).unwrap().dimensions(), WORKING);
    }

    #[test]
    fn response_serializes_status_and_data() {
        let response = MattingResponse::success("ok", Some(serde_json::json!({"frames": 3})));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["frames"], 3);

        let failure = MattingResponse::failure(&MattingError::unexpected("secret path"));
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["message"], "Unexpected error");
        assert!(json.get("data").is_none());
    }
}
