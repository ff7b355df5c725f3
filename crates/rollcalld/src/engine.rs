use crate::config::Config;
use rollcall_core::attendance::AttendanceEvent;
use rollcall_core::extractor::ExtractorError;
use rollcall_core::gallery::GalleryError;
use rollcall_core::locator::LocatorError;
use rollcall_core::pipeline::PipelineError;
use rollcall_core::{
    AttendanceSession, ConfirmPolicy, EmbeddingExtractor, EnrolledIdentity, FaceLocator, Frame,
    Gallery, MatchPolicy, Matcher, OnnxEmbeddingExtractor, OnnxFaceLocator, Pipeline, SessionId,
};
use rollcall_store::{Store, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("no face detected in any enrollment frame")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from transport handlers to the engine thread.
enum EngineRequest {
    StartSession {
        reply: oneshot::Sender<Result<SessionId, EngineError>>,
    },
    EndSession {
        reply: oneshot::Sender<Result<Option<AttendanceSession>, EngineError>>,
    },
    SubmitFrame {
        frame: Frame,
        reply: oneshot::Sender<Result<Vec<AttendanceEvent>, EngineError>>,
    },
    Enroll {
        identity_id: String,
        display_name: String,
        frames: Vec<Frame>,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Revoke {
        identity_id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn start_session(&self) -> Result<SessionId, EngineError> {
        self.request(|reply| EngineRequest::StartSession { reply })
            .await
    }

    pub async fn end_session(&self) -> Result<Option<AttendanceSession>, EngineError> {
        self.request(|reply| EngineRequest::EndSession { reply })
            .await
    }

    /// Push one captured frame through the pipeline. Frames must be
    /// submitted in capture order.
    pub async fn submit_frame(&self, frame: Frame) -> Result<Vec<AttendanceEvent>, EngineError> {
        self.request(|reply| EngineRequest::SubmitFrame { frame, reply })
            .await
    }

    /// Enroll an identity from reference photos, returning the number
    /// of reference embeddings extracted.
    pub async fn enroll(
        &self,
        identity_id: String,
        display_name: String,
        frames: Vec<Frame>,
    ) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            identity_id,
            display_name,
            frames,
            reply,
        })
        .await
    }

    pub async fn revoke(&self, identity_id: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Revoke { identity_id, reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the store, loads both ONNX models, and optionally resumes an
/// unfinished session. Fails fast at startup if any resource is
/// unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let mut store = Store::open(&config.db_path)?;
    let gallery = Arc::new(store.load_gallery()?);

    let locator = OnnxFaceLocator::load(&config.locator_model_path())?;
    tracing::info!(path = %config.locator_model_path(), "face locator loaded");

    let extractor = OnnxEmbeddingExtractor::load(&config.extractor_model_path())?;
    tracing::info!(path = %config.extractor_model_path(), "embedding extractor loaded");

    let matcher = Matcher::new(
        gallery.clone(),
        MatchPolicy {
            threshold: config.match_threshold,
            margin: config.match_margin,
        },
    );
    let mut pipeline = Pipeline::new(
        Box::new(locator),
        Box::new(extractor),
        matcher,
        ConfirmPolicy {
            required_matches: config.confirm_matches,
            window: chrono::Duration::milliseconds(config.confirm_window_ms as i64),
        },
        config.sample_every,
    );

    if config.resume_open_session {
        if let Some(session) = store.latest_open_session()? {
            if let Some(previous) = pipeline.resume_session(session) {
                store.close_session(&previous)?;
            }
        }
    }

    let camera_id = config.camera_id.clone();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::StartSession { reply } => {
                        let result = run_start_session(&mut pipeline, &store, &camera_id);
                        let _ = reply.send(result);
                    }
                    EngineRequest::EndSession { reply } => {
                        let result = run_end_session(&mut pipeline, &store);
                        let _ = reply.send(result);
                    }
                    EngineRequest::SubmitFrame { frame, reply } => {
                        let result = pipeline
                            .process_frame(&frame, &mut store)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll {
                        identity_id,
                        display_name,
                        frames,
                        reply,
                    } => {
                        let result = run_enroll(
                            &mut pipeline,
                            &mut store,
                            &gallery,
                            identity_id,
                            display_name,
                            &frames,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Revoke { identity_id, reply } => {
                        let result = run_revoke(&mut store, &gallery, &identity_id);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

fn run_start_session(
    pipeline: &mut Pipeline,
    store: &Store,
    camera_id: &str,
) -> Result<SessionId, EngineError> {
    let (id, abandoned) = pipeline.start_session();
    // An abandoned session must be closed in the store as well, or a
    // later restart would resume it as the latest open session.
    if let Some(previous) = abandoned {
        store.close_session(&previous)?;
    }
    let session = pipeline.session().ok_or(PipelineError::NoSession)?;
    store.create_session(session, camera_id)?;
    Ok(id)
}

fn run_end_session(
    pipeline: &mut Pipeline,
    store: &Store,
) -> Result<Option<AttendanceSession>, EngineError> {
    let Some(session) = pipeline.end_session() else {
        return Ok(None);
    };
    store.close_session(&session)?;
    Ok(Some(session))
}

/// Extract one reference embedding per usable photo: best face per
/// frame, same extractor contract the pipeline uses.
fn run_enroll(
    pipeline: &mut Pipeline,
    store: &mut Store,
    gallery: &Arc<Gallery>,
    identity_id: String,
    display_name: String,
    frames: &[Frame],
) -> Result<usize, EngineError> {
    let mut references = Vec::new();

    for frame in frames {
        let regions = pipeline.locator_mut().locate(frame)?;
        let Some(best) = regions.first() else {
            tracing::warn!(camera = %frame.camera_id, "enrollment frame has no face");
            continue;
        };
        match pipeline.extractor_mut().extract(frame, best) {
            Ok(embedding) => references.push(embedding),
            Err(err) => {
                tracing::warn!(error = %err, "enrollment frame unusable");
            }
        }
    }

    if references.is_empty() {
        return Err(EngineError::NoFaceDetected);
    }

    let identity = EnrolledIdentity {
        id: identity_id,
        display_name,
        references,
    };
    store.enroll_identity(&identity)?;
    let count = identity.references.len();
    gallery.enroll(identity)?;
    Ok(count)
}

fn run_revoke(
    store: &mut Store,
    gallery: &Arc<Gallery>,
    identity_id: &str,
) -> Result<bool, EngineError> {
    let removed = store.remove_identity(identity_id)?;
    gallery.revoke(identity_id);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::extractor::EmbeddingExtractor;
    use rollcall_core::locator::FaceLocator;
    use rollcall_core::{Embedding, FaceRegion};

    struct NoFaceLocator;

    impl FaceLocator for NoFaceLocator {
        fn locate(&mut self, _frame: &Frame) -> Result<Vec<FaceRegion>, LocatorError> {
            Ok(Vec::new())
        }
    }

    struct UnusedExtractor;

    impl EmbeddingExtractor for UnusedExtractor {
        fn extract(
            &mut self,
            _frame: &Frame,
            _region: &FaceRegion,
        ) -> Result<Embedding, ExtractorError> {
            Err(ExtractorError::ExtractionFailed("not used".into()))
        }
    }

    fn idle_pipeline() -> Pipeline {
        let matcher = Matcher::new(Arc::new(Gallery::new()), MatchPolicy::default());
        Pipeline::new(
            Box::new(NoFaceLocator),
            Box::new(UnusedExtractor),
            matcher,
            ConfirmPolicy::default(),
            1,
        )
    }

    #[test]
    fn test_start_while_open_closes_abandoned_session_in_store() {
        let store = Store::open_in_memory().unwrap();
        let mut pipeline = idle_pipeline();

        let first = run_start_session(&mut pipeline, &store, "cam0").unwrap();
        let second = run_start_session(&mut pipeline, &store, "cam0").unwrap();
        assert_ne!(first, second);

        // Only the live session may remain open, so a restart resumes
        // the right one.
        let open = store.latest_open_session().unwrap().unwrap();
        assert_eq!(open.id, second);

        run_end_session(&mut pipeline, &store).unwrap();
        assert!(store.latest_open_session().unwrap().is_none());
    }
}
