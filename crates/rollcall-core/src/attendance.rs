//! Attendance sessions, N-of-W confirmation, and event deduplication.
//!
//! A person standing in front of the camera produces a match on nearly
//! every sampled frame. The deduplicator folds that stream into at most
//! one attendance event per identity per session: an identity must
//! match N times within a window W before it is confirmed, and the
//! emitted event carries the timestamp of the first qualifying match —
//! arrival time, not confirmation time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of one attendance session (e.g., one class period).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One confirmed attendance record. Immutable once created; produced at
/// most once per (identity, session) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity_id: String,
    pub display_name: String,
    /// Timestamp of the first qualifying match, not the Nth.
    pub timestamp: DateTime<Utc>,
    /// Mean match score over the qualifying run, in [0, 1].
    pub confidence: f32,
    pub session_id: SessionId,
}

/// Scope for duplicate suppression. Owns the identity -> first-seen map
/// for its window; passed explicitly so concurrent classes never share
/// state.
#[derive(Debug, Clone)]
pub struct AttendanceSession {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    first_seen: HashMap<String, DateTime<Utc>>,
}

impl AttendanceSession {
    /// Open a fresh session starting now-ish.
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            started_at,
            ended_at: None,
            first_seen: HashMap::new(),
        }
    }

    /// Rebuild a session from persisted state, e.g. after a restart
    /// mid-class. Identities already recorded stay recorded.
    pub fn resume(
        id: SessionId,
        started_at: DateTime<Utc>,
        attended: HashMap<String, DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            started_at,
            ended_at: None,
            first_seen: attended,
        }
    }

    pub fn end(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
    }

    pub fn attended_count(&self) -> usize {
        self.first_seen.len()
    }

    pub fn has_attended(&self, identity_id: &str) -> bool {
        self.first_seen.contains_key(identity_id)
    }

    /// Attended identity ids, sorted for stable display.
    pub fn roster(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.first_seen.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    fn mark_attended(
        &mut self,
        identity_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ConsistencyError> {
        if self.first_seen.contains_key(identity_id) {
            return Err(ConsistencyError {
                identity_id: identity_id.to_string(),
                session_id: self.id,
            });
        }
        self.first_seen.insert(identity_id.to_string(), timestamp);
        Ok(())
    }
}

/// A second event for the same (identity, session) pair. Structurally
/// impossible if the state machine is intact, so observing this means a
/// deduplicator bug and is surfaced loudly instead of being swallowed.
#[derive(Error, Debug)]
#[error("duplicate attendance for identity {identity_id} in session {session_id}: state machine violated")]
pub struct ConsistencyError {
    pub identity_id: String,
    pub session_id: SessionId,
}

/// N-of-W confirmation policy.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmPolicy {
    /// Positive matches required before an identity is confirmed.
    pub required_matches: u32,
    /// Sliding window within which the matches must accumulate,
    /// measured from the first match of the run.
    pub window: Duration,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            required_matches: 3,
            window: Duration::milliseconds(2000),
        }
    }
}

/// Per-identity confirmation progress within the current session.
#[derive(Debug)]
enum TrackState {
    /// Matched at least once, fewer than N times so far.
    Pending {
        first_seen: DateTime<Utc>,
        matches: u32,
        score_sum: f32,
    },
    /// Event emitted; further matches are silently absorbed.
    Confirmed,
}

/// Converts a per-frame stream of positive matches into at-most-one
/// attendance event per identity. Owns the session it is scoped to.
pub struct Deduplicator {
    policy: ConfirmPolicy,
    session: AttendanceSession,
    states: HashMap<String, TrackState>,
}

impl Deduplicator {
    pub fn new(policy: ConfirmPolicy, session: AttendanceSession) -> Self {
        // Identities persisted as attended (resumed sessions) start out
        // confirmed so they cannot emit again.
        let states = session
            .first_seen
            .keys()
            .map(|id| (id.clone(), TrackState::Confirmed))
            .collect();
        Self {
            policy,
            session,
            states,
        }
    }

    pub fn session(&self) -> &AttendanceSession {
        &self.session
    }

    /// Record one positive match for `identity_id` at `timestamp` with a
    /// match score in [0, 1]. Returns an event exactly when the identity
    /// transitions to confirmed.
    ///
    /// Callers must feed matches in capture order per stream; the
    /// first-seen timestamp semantics depend on it.
    pub fn observe(
        &mut self,
        identity_id: &str,
        display_name: &str,
        timestamp: DateTime<Utc>,
        score: f32,
    ) -> Result<Option<AttendanceEvent>, ConsistencyError> {
        let required = self.policy.required_matches.max(1);
        let window = self.policy.window;

        let state = self
            .states
            .entry(identity_id.to_string())
            .or_insert(TrackState::Pending {
                first_seen: timestamp,
                matches: 0,
                score_sum: 0.0,
            });

        let (first_ts, confidence) = match state {
            TrackState::Confirmed => return Ok(None),
            TrackState::Pending {
                first_seen,
                matches,
                score_sum,
            } => {
                if *matches > 0 && timestamp - *first_seen > window {
                    // Stale partial evidence: the window elapsed before
                    // reaching N, so this match restarts the count at 1.
                    tracing::debug!(
                        identity = identity_id,
                        dropped_matches = *matches,
                        "confirmation window elapsed, restarting count"
                    );
                    *first_seen = timestamp;
                    *matches = 0;
                    *score_sum = 0.0;
                }

                *matches += 1;
                *score_sum += score;

                if *matches < required {
                    return Ok(None);
                }
                (*first_seen, *score_sum / *matches as f32)
            }
        };

        self.session.mark_attended(identity_id, first_ts)?;
        self.states
            .insert(identity_id.to_string(), TrackState::Confirmed);

        let event = AttendanceEvent {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            timestamp: first_ts,
            confidence,
            session_id: self.session.id,
        };

        tracing::info!(
            identity = identity_id,
            session = %self.session.id,
            first_seen = %event.timestamp,
            confidence = event.confidence,
            "attendance confirmed"
        );
        Ok(Some(event))
    }

    /// Close the session, discarding any pending partial evidence.
    pub fn finish(mut self, ended_at: DateTime<Utc>) -> AttendanceSession {
        self.session.end(ended_at);
        self.session
    }
}

/// Recorder collaborator boundary: persists confirmed events. The
/// deduplicator guarantees at-most-once emission per identity per
/// session, but implementations should still tolerate retried
/// deliveries without corrupting the roster.
pub trait AttendanceRecorder {
    fn record(&mut self, event: &AttendanceEvent) -> Result<(), RecorderError>;
}

#[derive(Error, Debug)]
#[error("recorder: {0}")]
pub struct RecorderError(pub String);

impl RecorderError {
    pub fn new(source: impl std::fmt::Display) -> Self {
        Self(source.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
    }

    fn dedup(required: u32, window_ms: i64) -> Deduplicator {
        Deduplicator::new(
            ConfirmPolicy {
                required_matches: required,
                window: Duration::milliseconds(window_ms),
            },
            AttendanceSession::begin(ts(0)),
        )
    }

    #[test]
    fn test_confirms_after_n_matches_with_first_seen_timestamp() {
        let mut dedup = dedup(3, 2000);

        assert!(dedup.observe("s1", "Ada", ts(0), 0.9).unwrap().is_none());
        assert!(dedup.observe("s1", "Ada", ts(400), 0.8).unwrap().is_none());
        let event = dedup.observe("s1", "Ada", ts(900), 0.7).unwrap().unwrap();

        assert_eq!(event.identity_id, "s1");
        assert_eq!(event.timestamp, ts(0));
        assert!((event.confidence - 0.8).abs() < 1e-6);
        assert!(dedup.session().has_attended("s1"));
    }

    #[test]
    fn test_at_most_one_event() {
        let mut dedup = dedup(2, 2000);

        assert!(dedup.observe("s1", "Ada", ts(0), 0.9).unwrap().is_none());
        assert!(dedup.observe("s1", "Ada", ts(100), 0.9).unwrap().is_some());

        // Arbitrarily many further matches stay silent
        for i in 0..50 {
            assert!(dedup
                .observe("s1", "Ada", ts(200 + i * 10), 0.9)
                .unwrap()
                .is_none());
        }
        assert_eq!(dedup.session().attended_count(), 1);
    }

    #[test]
    fn test_stale_evidence_restarts_from_one() {
        let mut dedup = dedup(3, 2000);

        assert!(dedup.observe("s1", "Ada", ts(0), 0.9).unwrap().is_none());
        // Window elapses; this match must count as 1, not 2
        assert!(dedup.observe("s1", "Ada", ts(2500), 0.9).unwrap().is_none());
        assert!(dedup.observe("s1", "Ada", ts(2600), 0.9).unwrap().is_none());
        let event = dedup.observe("s1", "Ada", ts(2700), 0.9).unwrap().unwrap();

        // First-seen anchors to the restarted run
        assert_eq!(event.timestamp, ts(2500));
    }

    #[test]
    fn test_single_glimpse_never_attends() {
        let mut dedup = dedup(3, 2000);
        assert!(dedup.observe("s1", "Ada", ts(0), 0.9).unwrap().is_none());
        let session = dedup.finish(ts(10_000));
        assert_eq!(session.attended_count(), 0);
    }

    #[test]
    fn test_required_one_confirms_immediately() {
        let mut dedup = dedup(1, 2000);
        let event = dedup.observe("s1", "Ada", ts(5), 0.9).unwrap().unwrap();
        assert_eq!(event.timestamp, ts(5));
    }

    #[test]
    fn test_identities_tracked_independently() {
        let mut dedup = dedup(2, 2000);

        assert!(dedup.observe("s1", "Ada", ts(0), 0.9).unwrap().is_none());
        assert!(dedup.observe("s2", "Bea", ts(50), 0.9).unwrap().is_none());
        assert!(dedup.observe("s1", "Ada", ts(100), 0.9).unwrap().is_some());
        assert!(dedup.observe("s2", "Bea", ts(150), 0.9).unwrap().is_some());
        assert_eq!(dedup.session().attended_count(), 2);
    }

    #[test]
    fn test_session_isolation() {
        let policy = ConfirmPolicy {
            required_matches: 2,
            window: Duration::milliseconds(2000),
        };

        let mut first = Deduplicator::new(policy, AttendanceSession::begin(ts(0)));
        assert!(first.observe("s1", "Ada", ts(0), 0.9).unwrap().is_none());
        assert!(first.observe("s1", "Ada", ts(100), 0.9).unwrap().is_some());
        let first_session = first.finish(ts(1000));

        // A new session must neither suppress s1 nor inherit its state
        let mut second = Deduplicator::new(policy, AttendanceSession::begin(ts(2000)));
        assert!(second.observe("s1", "Ada", ts(2000), 0.9).unwrap().is_none());
        let event = second.observe("s1", "Ada", ts(2100), 0.9).unwrap().unwrap();
        assert_ne!(event.session_id, first_session.id);
    }

    #[test]
    fn test_resumed_session_absorbs_recorded_identities() {
        let mut attended = HashMap::new();
        attended.insert("s1".to_string(), ts(0));
        let session = AttendanceSession::resume(SessionId::new(), ts(0), attended);

        let mut dedup = Deduplicator::new(ConfirmPolicy::default(), session);
        for i in 0..5 {
            assert!(dedup
                .observe("s1", "Ada", ts(100 + i * 100), 0.9)
                .unwrap()
                .is_none());
        }
        assert_eq!(dedup.session().attended_count(), 1);
    }

    #[test]
    fn test_duplicate_mark_is_loud() {
        let mut session = AttendanceSession::begin(ts(0));
        session.mark_attended("s1", ts(0)).unwrap();
        assert!(session.mark_attended("s1", ts(100)).is_err());
    }

    #[test]
    fn test_roster_sorted() {
        let mut session = AttendanceSession::begin(ts(0));
        session.mark_attended("s2", ts(0)).unwrap();
        session.mark_attended("s1", ts(10)).unwrap();
        assert_eq!(session.roster(), vec!["s1", "s2"]);
    }
}
