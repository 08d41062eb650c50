//! Pipeline Orchestrator
//!
//! Runs one pick-and-upload invocation through
//! `Picking -> IssuingTicket -> Uploading -> Verifying -> Finalizing` and
//! resolves it to exactly one [`UploadOutcome`].
//!
//! The orchestrator owns the single-flight guard: while an invocation is in a
//! non-terminal state any other invocation gets `Failure { stage: busy }`
//! without touching the picker. The guard is an RAII [`Flight`] so the state
//! always leaves its in-flight value, whether the run returns, fails, or panics.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::finalize::FinalizeClient;
use crate::http::build_client;
use crate::picker::{Acquired, PhotoAcquirer, PhotoPicker, ResourceLoader};
use crate::ticket::TicketClient;
use crate::transfer::TransferExecutor;
use crate::types::{AppResult, FinalizeRequest, SessionSource, Stage, UploadOutcome, UploadSuccess};
use crate::utils::mask_secret;
use crate::verify::Verifier;

/// Whether an error message reads as a user cancellation.
///
/// This is a heuristic over free text: platform pickers report dismissal as
/// an error whose wording varies, so any message containing "cancel"
/// (case-insensitive) counts. It is only consulted for picker errors and
/// panics, never for backend stages.
pub fn is_cancellation_message(message: &str) -> bool {
    message.to_lowercase().contains("cancel")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Picking,
    IssuingTicket,
    Uploading,
    Verifying,
    Finalizing,
    Succeeded,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::Cancelled | PipelineState::Failed
        )
    }

    /// True while an invocation owns the pipeline.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal() && *self != PipelineState::Idle
    }

    fn terminal_for(outcome: &UploadOutcome) -> Self {
        match outcome {
            UploadOutcome::Success(_) => PipelineState::Succeeded,
            UploadOutcome::Cancelled => PipelineState::Cancelled,
            UploadOutcome::Failure { .. } => PipelineState::Failed,
        }
    }

    /// Stage blamed for a panic raised while in this state.
    fn stage(&self) -> Stage {
        match self {
            PipelineState::IssuingTicket => Stage::Ticket,
            PipelineState::Uploading => Stage::Upload,
            PipelineState::Verifying => Stage::Verify,
            PipelineState::Finalizing => Stage::Finalize,
            _ => Stage::Picker,
        }
    }
}

/// Per-invocation options from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub fortune_id: String,
    /// Wins over the session's token when non-empty
    pub access_token: Option<String>,
}

impl UploadOptions {
    pub fn new(fortune_id: impl Into<String>) -> Self {
        Self {
            fortune_id: fortune_id.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

fn lock_state(state: &Mutex<PipelineState>) -> MutexGuard<'_, PipelineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ownership of the pipeline for one invocation.
///
/// Resolution happens once; later calls to [`Flight::resolve`] return the
/// first outcome. Dropping an unresolved flight marks the pipeline `Failed`.
struct Flight<'a> {
    state: &'a Mutex<PipelineState>,
    outcome: OnceLock<UploadOutcome>,
}

impl<'a> Flight<'a> {
    /// Claim the pipeline, or `None` if another invocation holds it.
    fn begin(state: &'a Mutex<PipelineState>) -> Option<Self> {
        let mut current = lock_state(state);
        if current.is_in_flight() {
            return None;
        }
        *current = PipelineState::Picking;

        Some(Self {
            state,
            outcome: OnceLock::new(),
        })
    }

    fn advance(&self, next: PipelineState) {
        if self.outcome.get().is_some() {
            return;
        }
        let mut current = lock_state(self.state);
        debug!(from = ?*current, to = ?next, "Pipeline state change");
        *current = next;
    }

    fn current(&self) -> PipelineState {
        *lock_state(self.state)
    }

    fn resolve(&self, outcome: UploadOutcome) -> UploadOutcome {
        let resolved = self.outcome.get_or_init(|| {
            *lock_state(self.state) = PipelineState::terminal_for(&outcome);
            outcome
        });
        resolved.clone()
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.outcome.get().is_none() {
            warn!("Upload flight dropped before resolving");
            *lock_state(self.state) = PipelineState::Failed;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unexpected error".to_string()
    }
}

pub struct UploadPipeline {
    acquirer: PhotoAcquirer,
    tickets: TicketClient,
    transfer: TransferExecutor,
    verifier: Verifier,
    finalizer: FinalizeClient,
    session: Arc<dyn SessionSource>,
    settle: Duration,
    state: Mutex<PipelineState>,
}

impl UploadPipeline {
    pub fn new(
        config: &Config,
        picker: Arc<dyn PhotoPicker>,
        session: Arc<dyn SessionSource>,
    ) -> AppResult<Self> {
        let api = build_client(&config.http, config.http.request_timeout)?;
        let upload = build_client(&config.http, config.http.upload_timeout)?;

        Ok(Self {
            acquirer: PhotoAcquirer::new(
                picker,
                ResourceLoader::new(api.clone()),
                config.pipeline.dimension_probe_timeout,
            ),
            tickets: TicketClient::new(api.clone()),
            transfer: TransferExecutor::new(upload),
            verifier: Verifier::new(api.clone()),
            finalizer: FinalizeClient::new(
                api,
                config.pipeline.finalize_max_attempts,
                config.pipeline.finalize_backoff,
            ),
            session,
            settle: config.pipeline.upload_settle,
            state: Mutex::new(PipelineState::Idle),
        })
    }

    pub fn state(&self) -> PipelineState {
        *lock_state(&self.state)
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_in_flight()
    }

    /// The photo acquirer, for picking without uploading.
    pub fn acquirer(&self) -> &PhotoAcquirer {
        &self.acquirer
    }

    /// Pick one photo and get it stored and linked to `options.fortune_id`.
    pub async fn pick_and_upload(&self, options: UploadOptions) -> UploadOutcome {
        let Some(flight) = Flight::begin(&self.state) else {
            warn!(fortune_id = %options.fortune_id, "Upload already in progress");
            return UploadOutcome::busy();
        };

        info!(fortune_id = %options.fortune_id, "Starting pick and upload");

        let outcome = match AssertUnwindSafe(self.run(&flight, &options))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let stage = flight.current().stage();
                error!(stage = %stage, error = %message, "Unhandled error in upload pipeline");
                if is_cancellation_message(&message) {
                    UploadOutcome::Cancelled
                } else {
                    UploadOutcome::failure(stage, message)
                }
            }
        };

        let outcome = flight.resolve(outcome);
        match &outcome {
            UploadOutcome::Success(success) => {
                info!(path = %success.path, replaced = success.replaced, "Upload pipeline succeeded")
            }
            UploadOutcome::Cancelled => info!("Upload pipeline cancelled"),
            UploadOutcome::Failure { stage, message } => {
                warn!(stage = %stage, error = %message, "Upload pipeline failed")
            }
        }
        outcome
    }

    async fn run(&self, flight: &Flight<'_>, options: &UploadOptions) -> UploadOutcome {
        let fortune_id = options.fortune_id.trim();
        if fortune_id.is_empty() {
            return UploadOutcome::failure(Stage::Ticket, "Missing fortuneId");
        }

        let photo = match self.acquirer.acquire().await {
            Ok(Acquired::Photo(photo)) => photo,
            Ok(Acquired::Cancelled) => return UploadOutcome::Cancelled,
            Err(e) if e.is_cancellation() => {
                info!(error = %e, "Picker reported cancellation");
                return UploadOutcome::Cancelled;
            }
            Err(e) => return UploadOutcome::failure(Stage::Picker, e.to_string()),
        };

        let mut session = self.session.current();
        if let Some(token) = options.access_token.as_deref().filter(|t| !t.is_empty()) {
            session.access_token = Some(token.to_string());
        }
        debug!(
            base_url = %session.base_url,
            token = %mask_secret(session.bearer_token()),
            "Using backend session"
        );

        flight.advance(PipelineState::IssuingTicket);
        let ticket = match self.tickets.issue(&session, fortune_id, &photo.mime_type).await {
            Ok(ticket) => ticket,
            Err(e) => return UploadOutcome::failure(Stage::Ticket, e.to_string()),
        };

        flight.advance(PipelineState::Uploading);
        if let Err(e) = self.transfer.transfer(&ticket, &photo).await {
            return UploadOutcome::failure(Stage::Upload, e.to_string());
        }

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        flight.advance(PipelineState::Verifying);
        if let Err(e) = self
            .verifier
            .verify(&session, &ticket.bucket, &ticket.bucket_relative_path)
            .await
        {
            return UploadOutcome::failure(Stage::Verify, e.to_string());
        }

        flight.advance(PipelineState::Finalizing);
        let request = FinalizeRequest::new(fortune_id, &ticket, &photo);
        let result = match self.finalizer.finalize(&session, &request).await {
            Ok(result) => result,
            Err(e) => return UploadOutcome::failure(Stage::Finalize, e.to_string()),
        };

        UploadOutcome::Success(UploadSuccess {
            signed_url: result.signed_url,
            replaced: result.replaced,
            path: ticket.bucket_relative_path,
            width: photo.width,
            height: photo.height,
            size_bytes: photo.size_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::FINALIZE_ENDPOINT;
    use crate::picker::tests::{data_url, png_bytes, StubPicker};
    use crate::picker::{PickerError, PickerRequest, PickerResponse};
    use crate::ticket::TICKET_ENDPOINT;
    use crate::types::{SessionContext, StaticSession};
    use async_trait::async_trait;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;

    const LIST_PATH: &str = "/storage/v1/object/list/photos/u1";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.pipeline.finalize_backoff = Duration::from_millis(10);
        config.pipeline.upload_settle = Duration::ZERO;
        config
    }

    fn build_pipeline(server_url: &str, picker: Arc<dyn PhotoPicker>) -> UploadPipeline {
        let session = SessionContext::new(server_url)
            .with_access_token("session-token")
            .with_anon_key("anon");
        UploadPipeline::new(&test_config(), picker, Arc::new(StaticSession(session))).unwrap()
    }

    fn png_picker(png: &[u8]) -> Arc<StubPicker> {
        Arc::new(StubPicker::returning(Some(PickerResponse::from_location(
            data_url("image/png", png),
        ))))
    }

    async fn ticket_mock(server: &mut mockito::ServerGuard) -> mockito::Mock {
        let body = json!({
            "url": format!("{}/upload/u1/p.jpg", server.url()),
            "bucketRelativePath": "u1/p.jpg",
            "bucket": "photos",
            "uploadMethod": "PUT"
        });
        server
            .mock("POST", TICKET_ENDPOINT)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await
    }

    async fn upload_mock(server: &mut mockito::ServerGuard, expect: usize) -> mockito::Mock {
        server
            .mock("PUT", "/upload/u1/p.jpg")
            .match_header("content-type", "image/png")
            .with_status(200)
            .expect(expect)
            .create_async()
            .await
    }

    async fn listing_mock(server: &mut mockito::ServerGuard, body: &str, expect: usize) -> mockito::Mock {
        server
            .mock("GET", LIST_PATH)
            .match_query(Matcher::UrlEncoded("search".to_string(), "p.jpg".to_string()))
            .with_status(200)
            .with_body(body)
            .expect(expect)
            .create_async()
            .await
    }

    /// Picker that blocks until released, to hold the pipeline in flight.
    struct BlockingPicker {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PhotoPicker for BlockingPicker {
        async fn pick(&self, _request: &PickerRequest) -> Result<Option<PickerResponse>, PickerError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(None)
        }
    }

    struct PanickingPicker(&'static str);

    #[async_trait]
    impl PhotoPicker for PanickingPicker {
        async fn pick(&self, _request: &PickerRequest) -> Result<Option<PickerResponse>, PickerError> {
            panic!("{}", self.0);
        }
    }

    #[test]
    fn test_cancellation_heuristic() {
        assert!(is_cancellation_message("User cancelled photos app"));
        assert!(is_cancellation_message("CANCELED"));
        assert!(!is_cancellation_message("Network timeout"));
    }

    #[tokio::test]
    async fn test_full_pipeline_success() {
        let mut server = mockito::Server::new_async().await;
        let png = png_bytes(4, 2);

        let ticket = ticket_mock(&mut server).await;
        let upload = upload_mock(&mut server, 1).await;
        let listing = listing_mock(&mut server, r#"[{"name":"p.jpg"}]"#, 1).await;
        let finalize = server
            .mock("POST", FINALIZE_ENDPOINT)
            .match_header("authorization", "Bearer session-token")
            .match_body(Matcher::PartialJson(json!({
                "fortune_id": "f-1",
                "path": "u1/p.jpg",
                "mime": "image/png",
                "width": 4,
                "height": 2
            })))
            .with_status(200)
            .with_body(r#"{"signedUrl":"https://signed","replaced":true}"#)
            .create_async()
            .await;

        let pipeline = build_pipeline(&server.url(), png_picker(&png));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;

        assert_eq!(
            outcome,
            UploadOutcome::Success(UploadSuccess {
                signed_url: "https://signed".to_string(),
                replaced: true,
                path: "u1/p.jpg".to_string(),
                width: 4,
                height: 2,
                size_bytes: png.len() as u64,
            })
        );
        assert_eq!(pipeline.state(), PipelineState::Succeeded);
        assert!(!pipeline.is_busy());

        ticket.assert_async().await;
        upload.assert_async().await;
        listing.assert_async().await;
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_invocation_is_busy() {
        let picker = Arc::new(BlockingPicker {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let pipeline = build_pipeline("http://127.0.0.1:9", picker.clone());

        let first = pipeline.pick_and_upload(UploadOptions::new("f-1"));
        let second = async {
            picker.entered.notified().await;
            assert!(pipeline.is_busy());
            let outcome = pipeline.pick_and_upload(UploadOptions::new("f-2")).await;
            picker.release.notify_one();
            outcome
        };

        let (first, second) = tokio::join!(first, second);

        assert_eq!(second, UploadOutcome::busy());
        assert_eq!(first, UploadOutcome::Cancelled);
        assert!(!pipeline.is_busy());

        // The pipeline is usable again after resolution
        picker.release.notify_one();
        let third = pipeline.pick_and_upload(UploadOptions::new("f-3")).await;
        assert_eq!(third, UploadOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_picker_error_classification() {
        let cancelled = Arc::new(StubPicker::failing("User cancelled photos app"));
        let outcome = build_pipeline("http://127.0.0.1:9", cancelled)
            .pick_and_upload(UploadOptions::new("f-1"))
            .await;
        assert_eq!(outcome, UploadOutcome::Cancelled);

        let failing = Arc::new(StubPicker::failing("Network timeout"));
        let pipeline = build_pipeline("http://127.0.0.1:9", failing);
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;
        assert_eq!(outcome, UploadOutcome::failure(Stage::Picker, "Network timeout"));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_dismissed_picker_is_cancelled() {
        let pipeline = build_pipeline("http://127.0.0.1:9", Arc::new(StubPicker::returning(None)));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;
        assert_eq!(outcome, UploadOutcome::Cancelled);
        assert_eq!(pipeline.state(), PipelineState::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_fortune_id_skips_picker() {
        let picker = Arc::new(StubPicker::returning(None));
        let pipeline = build_pipeline("http://127.0.0.1:9", picker.clone());

        let outcome = pipeline.pick_and_upload(UploadOptions::new("  ")).await;

        assert_eq!(outcome, UploadOutcome::failure(Stage::Ticket, "Missing fortuneId"));
        assert_eq!(picker.calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn test_ticket_failure_stops_pipeline_and_uses_token_override() {
        let mut server = mockito::Server::new_async().await;
        let ticket = server
            .mock("POST", TICKET_ENDPOINT)
            .match_header("authorization", "Bearer override")
            .match_header("apikey", "anon")
            .match_body(Matcher::Json(json!({"fortune_id": "f-1", "mime": "image/png"})))
            .with_status(500)
            .with_body(r#"{"error":"boom"}"#)
            .create_async()
            .await;
        let upload = upload_mock(&mut server, 0).await;
        let listing = listing_mock(&mut server, "[]", 0).await;

        let pipeline = build_pipeline(&server.url(), png_picker(&png_bytes(2, 2)));
        let outcome = pipeline
            .pick_and_upload(UploadOptions::new("f-1").with_access_token("override"))
            .await;

        assert_eq!(outcome.stage(), Some(Stage::Ticket));
        match &outcome {
            UploadOutcome::Failure { message, .. } => assert!(message.contains("500")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        ticket.assert_async().await;
        upload.assert_async().await;
        listing.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_transfer_is_terminal_and_keeps_preview() {
        let mut server = mockito::Server::new_async().await;
        ticket_mock(&mut server).await;
        let upload = server
            .mock("PUT", "/upload/u1/p.jpg")
            .with_status(403)
            .with_body("RLS policy violation")
            .expect(1)
            .create_async()
            .await;
        let listing = listing_mock(&mut server, r#"[{"name":"p.jpg"}]"#, 0).await;
        let finalize = server
            .mock("POST", FINALIZE_ENDPOINT)
            .expect(0)
            .create_async()
            .await;

        let pipeline = build_pipeline(&server.url(), png_picker(&png_bytes(2, 2)));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;

        assert_eq!(
            outcome,
            UploadOutcome::failure(Stage::Upload, "Failed to upload image: 403 RLS policy violation")
        );
        assert_eq!(pipeline.state(), PipelineState::Failed);
        upload.assert_async().await;
        listing.assert_async().await;
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_listing_fails_verify_without_finalizing() {
        let mut server = mockito::Server::new_async().await;
        ticket_mock(&mut server).await;
        upload_mock(&mut server, 1).await;
        listing_mock(&mut server, "[]", 1).await;
        let finalize = server
            .mock("POST", FINALIZE_ENDPOINT)
            .expect(0)
            .create_async()
            .await;

        let pipeline = build_pipeline(&server.url(), png_picker(&png_bytes(2, 2)));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;

        assert_eq!(outcome.stage(), Some(Stage::Verify));
        match &outcome {
            UploadOutcome::Failure { message, .. } => assert!(message.contains("not found")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_finalize_exhaustion_is_finalize_failure() {
        let mut server = mockito::Server::new_async().await;
        ticket_mock(&mut server).await;
        upload_mock(&mut server, 1).await;
        listing_mock(&mut server, r#"[{"name":"p.jpg"}]"#, 1).await;
        let finalize = server
            .mock("POST", FINALIZE_ENDPOINT)
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let pipeline = build_pipeline(&server.url(), png_picker(&png_bytes(2, 2)));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;

        assert_eq!(outcome.stage(), Some(Stage::Finalize));
        assert!(!pipeline.is_busy());
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_classified() {
        let pipeline = build_pipeline("http://127.0.0.1:9", Arc::new(PanickingPicker("picker exploded")));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;
        assert_eq!(outcome, UploadOutcome::failure(Stage::Picker, "picker exploded"));
        assert_eq!(pipeline.state(), PipelineState::Failed);

        let pipeline = build_pipeline("http://127.0.0.1:9", Arc::new(PanickingPicker("Operation cancelled")));
        let outcome = pipeline.pick_and_upload(UploadOptions::new("f-1")).await;
        assert_eq!(outcome, UploadOutcome::Cancelled);
        assert!(!pipeline.is_busy());
    }

    #[test]
    fn test_flight_resolves_once() {
        let state = Mutex::new(PipelineState::Idle);
        let flight = Flight::begin(&state).unwrap();
        assert!(Flight::begin(&state).is_none());

        let first = flight.resolve(UploadOutcome::Cancelled);
        let second = flight.resolve(UploadOutcome::failure(Stage::Upload, "late"));
        assert_eq!(first, UploadOutcome::Cancelled);
        assert_eq!(second, UploadOutcome::Cancelled);

        flight.advance(PipelineState::Uploading);
        drop(flight);
        assert_eq!(*lock_state(&state), PipelineState::Cancelled);
    }

    #[test]
    fn test_unresolved_flight_releases_on_drop() {
        let state = Mutex::new(PipelineState::Idle);
        {
            let flight = Flight::begin(&state).unwrap();
            flight.advance(PipelineState::Verifying);
        }
        assert_eq!(*lock_state(&state), PipelineState::Failed);
        assert!(Flight::begin(&state).is_some());
    }
}
