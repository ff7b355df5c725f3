//! Pipeline orchestrator: frame loop, sampling, and failure isolation.
//!
//! One pipeline instance per camera stream, processing frames strictly
//! in capture order. A bad region is skipped with a warning, never
//! retried — the same student will reappear in the next sampled frame.

use crate::attendance::{
    AttendanceEvent, AttendanceRecorder, AttendanceSession, ConfirmPolicy, ConsistencyError,
    Deduplicator, RecorderError, SessionId,
};
use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::locator::{FaceLocator, LocatorError};
use crate::matcher::Matcher;
use crate::types::{Frame, MatchOutcome};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame source: {0}")]
    Source(String),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("no active session")]
    NoSession,
}

/// Pull-style camera boundary. `Ok(None)` signals end of stream, which
/// the orchestrator treats as normal session termination.
///
/// This is the only place the pipeline may block.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(source: impl std::fmt::Display) -> Self {
        Self(source.to_string())
    }
}

/// Drives Locator -> Extractor -> Matcher -> Deduplicator per sampled
/// frame, forwarding confirmed events to the recorder.
pub struct Pipeline {
    locator: Box<dyn FaceLocator>,
    extractor: Box<dyn EmbeddingExtractor>,
    matcher: Matcher,
    confirm_policy: ConfirmPolicy,
    /// Process every Kth frame to bound CPU cost.
    sample_every: u64,
    frames_seen: u64,
    dedup: Option<Deduplicator>,
}

impl Pipeline {
    pub fn new(
        locator: Box<dyn FaceLocator>,
        extractor: Box<dyn EmbeddingExtractor>,
        matcher: Matcher,
        confirm_policy: ConfirmPolicy,
        sample_every: u64,
    ) -> Self {
        Self {
            locator,
            extractor,
            matcher,
            confirm_policy,
            sample_every: sample_every.max(1),
            frames_seen: 0,
            dedup: None,
        }
    }

    /// Open a new attendance session. Any session still open is
    /// finished and handed back so the caller can persist its closure;
    /// dropping it would leave the session open in storage forever.
    pub fn start_session(&mut self) -> (SessionId, Option<AttendanceSession>) {
        let abandoned = self.take_open_session();
        let session = AttendanceSession::begin(Utc::now());
        let id = session.id;
        tracing::info!(session = %id, "session started");
        self.dedup = Some(Deduplicator::new(self.confirm_policy, session));
        self.frames_seen = 0;
        (id, abandoned)
    }

    /// Resume a persisted session, e.g. after a mid-class restart.
    /// Returns the previously open session, if any, finished.
    pub fn resume_session(&mut self, session: AttendanceSession) -> Option<AttendanceSession> {
        let abandoned = self.take_open_session();
        tracing::info!(
            session = %session.id,
            already_attended = session.attended_count(),
            "session resumed"
        );
        self.dedup = Some(Deduplicator::new(self.confirm_policy, session));
        self.frames_seen = 0;
        abandoned
    }

    fn take_open_session(&mut self) -> Option<AttendanceSession> {
        let previous = self.dedup.take()?;
        let session = previous.finish(Utc::now());
        tracing::warn!(session = %session.id, "session left open, closing it");
        Some(session)
    }

    /// Close the current session, discarding pending partial evidence.
    pub fn end_session(&mut self) -> Option<AttendanceSession> {
        let session = self.dedup.take().map(|d| d.finish(Utc::now()));
        if let Some(session) = &session {
            tracing::info!(
                session = %session.id,
                attended = session.attended_count(),
                "session ended"
            );
        }
        session
    }

    pub fn session(&self) -> Option<&AttendanceSession> {
        self.dedup.as_ref().map(Deduplicator::session)
    }

    /// Borrow the loaded locator, e.g. to reuse it for enrollment
    /// captures instead of loading the model twice.
    pub fn locator_mut(&mut self) -> &mut dyn FaceLocator {
        self.locator.as_mut()
    }

    /// Borrow the loaded extractor; the enrollment contract is the same
    /// `extract` contract the pipeline uses.
    pub fn extractor_mut(&mut self) -> &mut dyn EmbeddingExtractor {
        self.extractor.as_mut()
    }

    /// Run one pipeline pass over a frame.
    ///
    /// Returns the attendance events confirmed by this frame (usually
    /// empty). Input errors reject the frame or region and keep going;
    /// resource and consistency errors propagate.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        recorder: &mut dyn AttendanceRecorder,
    ) -> Result<Vec<AttendanceEvent>, PipelineError> {
        if self.dedup.is_none() {
            return Err(PipelineError::NoSession);
        }

        let sampled = self.frames_seen % self.sample_every == 0;
        self.frames_seen += 1;
        if !sampled {
            return Ok(Vec::new());
        }

        let regions = match self.locator.locate(frame) {
            Ok(regions) => regions,
            Err(LocatorError::InvalidFrame(reason)) => {
                // Bad input rejects this frame only, never the stream.
                tracing::warn!(camera = %frame.camera_id, reason, "rejecting invalid frame");
                return Ok(Vec::new());
            }
            Err(other) => return Err(other.into()),
        };

        let mut events = Vec::new();

        for region in &regions {
            let embedding = match self.extractor.extract(frame, region) {
                Ok(embedding) => embedding,
                Err(err) => {
                    // One bad region must not abort the whole frame.
                    log_region_skip(frame, &err);
                    continue;
                }
            };

            let result = match self.matcher.match_probe(&embedding) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(camera = %frame.camera_id, error = %err, "skipping region");
                    continue;
                }
            };

            match result.outcome {
                MatchOutcome::Identified {
                    identity_id,
                    display_name,
                } => {
                    // Cosine distance -> similarity-style score in [0, 1].
                    let score = (1.0 - result.distance).clamp(0.0, 1.0);
                    let dedup = self.dedup.as_mut().ok_or(PipelineError::NoSession)?;
                    if let Some(event) =
                        dedup.observe(&identity_id, &display_name, frame.timestamp, score)?
                    {
                        recorder.record(&event)?;
                        events.push(event);
                    }
                }
                MatchOutcome::Unknown => {
                    tracing::debug!(
                        camera = %frame.camera_id,
                        distance = result.distance,
                        "unknown face"
                    );
                }
            }
        }

        Ok(events)
    }

    /// Pull frames until end of stream or cancellation, then close the
    /// session. Cancellation is checked at the frame boundary so an
    /// in-flight pass always completes — events are never half-written.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        recorder: &mut dyn AttendanceRecorder,
        cancel: &AtomicBool,
    ) -> Result<AttendanceSession, PipelineError> {
        if self.dedup.is_none() {
            return Err(PipelineError::NoSession);
        }

        loop {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("cancellation requested, stopping frame loop");
                break;
            }
            match source
                .next_frame()
                .map_err(|e| PipelineError::Source(e.to_string()))?
            {
                Some(frame) => {
                    self.process_frame(&frame, recorder)?;
                }
                None => {
                    tracing::info!("end of stream");
                    break;
                }
            }
        }

        self.end_session().ok_or(PipelineError::NoSession)
    }
}

fn log_region_skip(frame: &Frame, err: &ExtractorError) {
    tracing::warn!(
        camera = %frame.camera_id,
        error = %err,
        "skipping region, will retry on a later frame"
    );
}
