//! HTTP surface: landing page, MJPEG video feed, health check.
//!
//! Each `/video_feed` request runs one [`RecognitionStream`] on a dedicated
//! thread. The analyzer sits behind an async mutex; whoever holds its guard
//! owns the camera, so a second viewer gets 503 instead of fighting over the
//! device.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rollcall_core::{FaceAnalyzer, Gallery, Ledger};
use rollcall_hw::{Camera, CameraError, FrameSource};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::{EngineError, FrameKind, RecognitionStream, StreamSettings};

/// Multipart boundary separating JPEG parts in the video feed.
pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Frames buffered between the recognition thread and the HTTP body.
const FRAME_BUFFER: usize = 2;

/// Opens the camera for one streaming session.
pub trait CameraOpener: Send + Sync + 'static {
    type Source: FrameSource + Send + 'static;

    fn open(&self) -> Result<Self::Source, CameraError>;
}

/// Opens a V4L2 device at a fixed resolution.
#[derive(Debug, Clone)]
pub struct V4lOpener {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl CameraOpener for V4lOpener {
    type Source = Camera;

    fn open(&self) -> Result<Camera, CameraError> {
        Camera::open(&self.device, self.width, self.height)
    }
}

pub struct AppState<O, A> {
    opener: Arc<O>,
    analyzer: Arc<Mutex<A>>,
    gallery: Arc<Gallery>,
    ledger: Ledger,
    settings: StreamSettings,
}

impl<O, A> Clone for AppState<O, A> {
    fn clone(&self) -> Self {
        Self {
            opener: self.opener.clone(),
            analyzer: self.analyzer.clone(),
            gallery: self.gallery.clone(),
            ledger: self.ledger.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<O: CameraOpener, A: FaceAnalyzer + Send + 'static> AppState<O, A> {
    pub fn new(
        opener: O,
        analyzer: A,
        gallery: Gallery,
        ledger: Ledger,
        settings: StreamSettings,
    ) -> Self {
        Self {
            opener: Arc::new(opener),
            analyzer: Arc::new(Mutex::new(analyzer)),
            gallery: Arc::new(gallery),
            ledger,
            settings,
        }
    }
}

pub fn router<O, A>(state: AppState<O, A>) -> Router
where
    O: CameraOpener,
    A: FaceAnalyzer + Send + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/health", get(|| async { "OK" }))
        .route("/video_feed", get(video_feed::<O, A>))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn video_feed<O, A>(State(state): State<AppState<O, A>>) -> Response
where
    O: CameraOpener,
    A: FaceAnalyzer + Send + 'static,
{
    let Ok(analyzer) = state.analyzer.clone().try_lock_owned() else {
        tracing::info!("video feed rejected: camera already streaming");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "camera is already streaming to another client",
        )
            .into_response();
    };

    let opener = state.opener.clone();
    let source = match tokio::task::spawn_blocking(move || opener.open()).await {
        Ok(Ok(source)) => source,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "camera unavailable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("camera unavailable: {e}"),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "camera open task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let stream = RecognitionStream::new(
        source,
        Guarded(analyzer),
        state.gallery.clone(),
        state.ledger.clone(),
        state.settings.clone(),
    );
    let rx = match spawn_producer(stream) {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "failed to spawn stream thread");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Analyzer access for the lifetime of one stream.
struct Guarded<A>(OwnedMutexGuard<A>);

impl<A: FaceAnalyzer> FaceAnalyzer for Guarded<A> {
    fn analyze(
        &mut self,
        image: &image::RgbImage,
    ) -> Result<Vec<rollcall_core::DetectedFace>, rollcall_core::AnalyzerError> {
        self.0.analyze(image)
    }
}

type Chunk = Result<Bytes, EngineError>;

/// Run the stream on its own thread, forwarding multipart chunks.
///
/// The thread ends when the stream does or when the receiver is dropped;
/// either way the camera and the analyzer guard are released with it.
fn spawn_producer<S, A>(
    stream: RecognitionStream<S, Guarded<A>>,
) -> std::io::Result<mpsc::Receiver<Chunk>>
where
    S: FrameSource + Send + 'static,
    A: FaceAnalyzer + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    std::thread::Builder::new()
        .name("rollcall-stream".into())
        .spawn(move || pump(stream, tx))?;
    Ok(rx)
}

fn pump<S, A>(mut stream: RecognitionStream<S, A>, tx: mpsc::Sender<Chunk>)
where
    S: FrameSource,
    A: FaceAnalyzer,
{
    tracing::info!("video stream started");
    let mut sent = 0u64;

    for item in stream.by_ref() {
        let chunk = match item {
            Ok(frame) => {
                if let FrameKind::AttendanceTaken(name) = &frame.kind {
                    tracing::info!(
                        name = %name,
                        sequence = frame.sequence,
                        "attendance taken, ending stream"
                    );
                } else if !frame.faces.is_empty() {
                    let labels: Vec<&str> = frame.faces.iter().map(|f| f.label.as_str()).collect();
                    tracing::debug!(sequence = frame.sequence, ?labels, "frame analyzed");
                }
                Ok(multipart_chunk(&frame.jpeg))
            }
            Err(e) => {
                tracing::error!(error = %e, "recognition stream failed");
                Err(e)
            }
        };
        if tx.blocking_send(chunk).is_err() {
            tracing::info!("client disconnected");
            break;
        }
        sent += 1;
    }

    stream.stop();
    tracing::info!(
        frames_sent = sent,
        frames_read = stream.frames_read(),
        state = ?stream.state(),
        "video stream ended"
    );
    // Release the analyzer before the client sees the end of the body.
    drop(stream);
    drop(tx);
}

/// Wrap one JPEG as a multipart part.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let head = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = Vec::with_capacity(head.len() + jpeg.len() + 2);
    chunk.extend_from_slice(head.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

/// Resolves on Ctrl-C. A failed signal handler never resolves.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReadRetry;
    use crate::testing::{
        gallery_with, ledger_in, ledger_rows, probe, FixedAnalyzer, ScriptedSource, SourceProbe,
    };
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct FakeOpener {
        opened: Arc<std::sync::Mutex<Vec<SourceProbe>>>,
        fail: bool,
    }

    impl CameraOpener for FakeOpener {
        type Source = ScriptedSource;

        fn open(&self) -> Result<ScriptedSource, CameraError> {
            if self.fail {
                return Err(CameraError::DeviceNotFound("/dev/video9".into()));
            }
            let source = ScriptedSource::endless();
            self.opened.lock().unwrap().push(source.probe());
            Ok(source)
        }
    }

    fn app_state(
        opener: FakeOpener,
        distance: f32,
        ledger: Ledger,
    ) -> AppState<FakeOpener, FixedAnalyzer> {
        let settings = StreamSettings {
            retry: ReadRetry {
                max_attempts: 2,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
            ..StreamSettings::default()
        };
        AppState::new(
            opener,
            FixedAnalyzer::faces(vec![probe(distance)]),
            gallery_with("Alice").as_ref().clone(),
            ledger,
            settings,
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_index_links_video_feed() {
        let (_dir, ledger) = ledger_in();
        let app = router(app_state(FakeOpener::default(), 0.8, ledger));

        let response = app.oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains(r#"src="/video_feed""#));
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, ledger) = ledger_in();
        let app = router(app_state(FakeOpener::default(), 0.8, ledger));

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_video_feed_ends_after_attendance() {
        let (_dir, ledger) = ledger_in();
        let opener = FakeOpener::default();
        let state = app_state(opener.clone(), 0.3, ledger.clone());

        let response = router(state.clone()).oneshot(get("/video_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            MULTIPART_CONTENT_TYPE
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(body.ends_with(b"\r\n"));
        assert_eq!(body.windows(7).filter(|w| *w == b"--frame").count(), 1);
        assert_eq!(ledger_rows(ledger.path()), 1);
        assert!(ledger.is_marked_today("Alice").unwrap());

        assert!(opener.opened.lock().unwrap()[0].released());
        assert!(state.analyzer.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_second_viewer_is_rejected() {
        let (_dir, ledger) = ledger_in();
        let state = app_state(FakeOpener::default(), 0.8, ledger);
        let _held = state.analyzer.clone().lock_owned().await;

        let response = router(state).oneshot(get("/video_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_camera_open_failure_is_unavailable() {
        let (_dir, ledger) = ledger_in();
        let opener = FakeOpener {
            fail: true,
            ..FakeOpener::default()
        };
        let state = app_state(opener, 0.3, ledger.clone());

        let response = router(state.clone()).oneshot(get("/video_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("camera unavailable"));
        assert!(state.analyzer.try_lock().is_ok());
        assert_eq!(ledger_rows(ledger.path()), 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_camera() {
        let (_dir, ledger) = ledger_in();
        let opener = FakeOpener::default();
        let state = app_state(opener.clone(), 0.8, ledger);

        let response = router(state.clone()).oneshot(get("/video_feed")).await.unwrap();
        let mut frames = response.into_body().into_data_stream();
        for _ in 0..2 {
            let chunk = frames.next().await.unwrap().unwrap();
            assert!(chunk.starts_with(b"--frame\r\n"));
        }
        drop(frames);

        let camera = opener.opened.lock().unwrap()[0].clone();
        for _ in 0..200 {
            if camera.released() && state.analyzer.try_lock().is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("camera not released after client disconnect");
    }

    #[test]
    fn test_multipart_chunk_layout() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n"
        );
    }
}
