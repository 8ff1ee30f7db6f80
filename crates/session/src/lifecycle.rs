//! Submission and delivery bookkeeping shared by both session kinds.
//!
//! The core assigns a [`FrameId`] to every accepted frame, remembers it as
//! outstanding until the codec reports its outcome, and hands exactly one
//! [`FrameResult`] per frame to the caller's sink. Handler calls are
//! serialized, so the sink sees results in the order the codec emitted them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use vcs_common::{
    CodingError, CodingResult, CompletionSink, FrameEmitter, FrameId, FrameResult, FrameStatus,
    FrameToken, InfoFlags, MediaTime, SessionConfig, Status,
};

/// Lifecycle of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no frame submitted yet.
    Idle,
    Active,
    /// Terminal. Work already accepted may still be delivered.
    Invalidated,
}

/// Counters kept by every session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_submitted: u64,
    pub frames_completed: u64,
    pub frames_dropped: u64,
    pub frames_failed: u64,
    /// Buffers copied between caller and codec pools.
    pub buffer_copies: u64,
}

/// What the sink is told about one frame.
pub(crate) enum Outcome<T> {
    Output(T),
    Dropped,
    Failed(Status, String),
}

impl<T> From<CodingResult<Option<T>>> for Outcome<T> {
    fn from(result: CodingResult<Option<T>>) -> Self {
        match result {
            Ok(Some(output)) => Self::Output(output),
            Ok(None) => Self::Dropped,
            Err(e) => Self::Failed(e.status(), e.to_string()),
        }
    }
}

struct Pending {
    token: FrameToken,
    pts: MediaTime,
    duration: Option<MediaTime>,
    submitter: ThreadId,
    /// `submit_frame` for this frame has not returned yet.
    in_submit: bool,
    /// A result is being handed to the sink.
    delivering: bool,
}

struct CoreState {
    lifecycle: SessionState,
    next_id: u64,
    watermark: Option<MediaTime>,
    outstanding: BTreeMap<FrameId, Pending>,
    /// Flags of a frame delivered before its `submit_frame` returned.
    immediate: Option<(FrameId, InfoFlags)>,
    stats: SessionStats,
}

pub(crate) struct SessionCore<T> {
    kind: &'static str,
    state: Mutex<CoreState>,
    drained: Condvar,
    delivery: Mutex<()>,
    sink: Arc<dyn CompletionSink<T>>,
    drain_timeout: Option<Duration>,
}

impl<T> SessionCore<T> {
    pub(crate) fn new(
        kind: &'static str,
        sink: Arc<dyn CompletionSink<T>>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            kind,
            state: Mutex::new(CoreState {
                lifecycle: SessionState::Idle,
                next_id: 0,
                watermark: None,
                outstanding: BTreeMap::new(),
                immediate: None,
                stats: SessionStats::default(),
            }),
            drained: Condvar::new(),
            delivery: Mutex::new(()),
            sink,
            drain_timeout: config.drain_timeout(),
        }
    }

    pub(crate) fn check_usable(&self) -> CodingResult<()> {
        if self.state.lock().lifecycle == SessionState::Invalidated {
            return Err(CodingError::InvalidSession);
        }
        Ok(())
    }

    /// Accept a frame ordered by `order_ts`, which must exceed every
    /// timestamp accepted since the last watermark reset.
    pub(crate) fn begin_submit(
        &self,
        order_ts: MediaTime,
        pts: MediaTime,
        duration: Option<MediaTime>,
        token: FrameToken,
    ) -> CodingResult<FrameId> {
        let mut st = self.state.lock();
        if st.lifecycle == SessionState::Invalidated {
            return Err(CodingError::InvalidSession);
        }
        order_ts.validate()?;
        pts.validate()?;
        duration.map(MediaTime::validate).transpose()?;
        if let Some(last) = st.watermark {
            if order_ts <= last {
                return Err(CodingError::invalid_timestamp(order_ts, last));
            }
        }

        let id = FrameId(st.next_id);
        st.next_id += 1;
        st.watermark = Some(order_ts);
        st.lifecycle = SessionState::Active;
        st.outstanding.insert(
            id,
            Pending {
                token,
                pts,
                duration,
                submitter: thread::current().id(),
                in_submit: true,
                delivering: false,
            },
        );
        st.stats.frames_submitted += 1;
        debug!(session = self.kind, frame = %id, token = %token, pts = %pts, "Frame submitted");
        Ok(id)
    }

    /// Finish a submission after the codec entry point returned.
    ///
    /// A codec error for a frame it never reported is delivered to the sink
    /// as a failure and returned to the caller.
    pub(crate) fn end_submit(&self, id: FrameId, result: CodingResult<()>) -> CodingResult<InfoFlags> {
        let (undelivered, immediate) = {
            let mut st = self.state.lock();
            let undelivered = match st.outstanding.get_mut(&id) {
                Some(pending) => {
                    pending.in_submit = false;
                    !pending.delivering
                }
                None => false,
            };
            let immediate = match st.immediate {
                Some((done, flags)) if done == id => {
                    st.immediate = None;
                    Some(flags)
                }
                _ => None,
            };
            (undelivered, immediate)
        };

        match result {
            Ok(()) => Ok(immediate.unwrap_or(InfoFlags::ASYNCHRONOUS)),
            Err(e) => {
                if undelivered {
                    self.deliver(id, Outcome::Failed(e.status(), e.to_string()), InfoFlags::NONE);
                }
                Err(e)
            }
        }
    }

    /// Hand the outcome of `id` to the sink. Results for frames that are not
    /// outstanding are logged and ignored.
    pub(crate) fn deliver(&self, id: FrameId, outcome: Outcome<T>, extra: InfoFlags) {
        let _order = self.delivery.lock();

        let (token, pts, duration, mut flags) = {
            let mut st = self.state.lock();
            let Some(pending) = st.outstanding.get_mut(&id) else {
                warn!(session = self.kind, frame = %id, "Ignoring result for unknown frame");
                return;
            };
            if pending.delivering {
                warn!(session = self.kind, frame = %id, "Ignoring duplicate result");
                return;
            }
            pending.delivering = true;
            let mut flags = extra;
            if !pending.in_submit || pending.submitter != thread::current().id() {
                flags |= InfoFlags::ASYNCHRONOUS;
            }
            (pending.token, pending.pts, pending.duration, flags)
        };

        let (status, output) = match outcome {
            Outcome::Output(output) => (FrameStatus::Completed, Some(output)),
            Outcome::Dropped => {
                flags |= InfoFlags::FRAME_DROPPED;
                (FrameStatus::Dropped, None)
            }
            Outcome::Failed(status, reason) => {
                warn!(session = self.kind, frame = %id, ?status, reason = %reason, "Frame failed");
                (FrameStatus::Failed { status, reason }, None)
            }
        };
        let counter = match &status {
            FrameStatus::Completed => 0,
            FrameStatus::Dropped => 1,
            FrameStatus::Failed { .. } => 2,
        };

        debug!(session = self.kind, frame = %id, token = %token, ?flags, "Delivering frame");
        self.sink.on_frame(FrameResult {
            token,
            status,
            flags,
            pts,
            duration,
            output,
        });

        let mut st = self.state.lock();
        if let Some(pending) = st.outstanding.remove(&id) {
            if pending.in_submit {
                st.immediate = Some((id, flags));
            }
        }
        match counter {
            0 => st.stats.frames_completed += 1,
            1 => st.stats.frames_dropped += 1,
            _ => st.stats.frames_failed += 1,
        }
        self.drained.notify_all();
    }

    /// Block until every outstanding frame with a presentation time up to
    /// `until` (all frames when `None`) has been delivered.
    pub(crate) fn wait_for(&self, until: Option<MediaTime>) -> CodingResult<()> {
        let deadline = self.drain_timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock();
        loop {
            let waiting = st
                .outstanding
                .values()
                .filter(|p| until.map_or(true, |u| p.pts <= u))
                .count();
            if waiting == 0 {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut st, deadline).timed_out() {
                        let still = st
                            .outstanding
                            .values()
                            .filter(|p| until.map_or(true, |u| p.pts <= u))
                            .count();
                        if still == 0 {
                            return Ok(());
                        }
                        warn!(session = self.kind, pending = still, "Drain timed out");
                        return Err(CodingError::CodecMalfunction(format!(
                            "{still} frames still pending after {:?}",
                            self.drain_timeout.unwrap_or_default()
                        )));
                    }
                }
                None => self.drained.wait(&mut st),
            }
        }
    }

    /// Forget the submission watermark (start of a new pass).
    pub(crate) fn reset_watermark(&self) {
        self.state.lock().watermark = None;
    }

    /// Move to `Invalidated`. Returns false if already there.
    pub(crate) fn invalidate(&self) -> bool {
        let mut st = self.state.lock();
        if st.lifecycle == SessionState::Invalidated {
            return false;
        }
        st.lifecycle = SessionState::Invalidated;
        info!(
            session = self.kind,
            in_flight = st.outstanding.len(),
            submitted = st.stats.frames_submitted,
            "Session invalidated"
        );
        true
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.lock().lifecycle
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub(crate) fn frame_pts(&self, id: FrameId) -> Option<MediaTime> {
        self.state.lock().outstanding.get(&id).map(|p| p.pts)
    }

    pub(crate) fn record_copy(&self) {
        self.state.lock().stats.buffer_copies += 1;
    }

    pub(crate) fn stats(&self) -> SessionStats {
        self.state.lock().stats.clone()
    }
}

impl<T> FrameEmitter<T> for SessionCore<T> {
    fn emit(&self, frame: FrameId, result: CodingResult<Option<T>>) {
        self.deliver(frame, result.into(), InfoFlags::NONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Seen = Arc<Mutex<Vec<FrameResult<u32>>>>;

    fn core() -> (Arc<SessionCore<u32>>, Seen) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let core = SessionCore::new(
            "test",
            Arc::new(move |r: FrameResult<u32>| sink.lock().push(r)),
            &SessionConfig::default(),
        );
        (Arc::new(core), seen)
    }

    fn t(v: i64) -> MediaTime {
        MediaTime::new(v, 30)
    }

    #[test]
    fn synchronous_delivery_reports_immediate_flags() {
        let (core, seen) = core();
        let id = core.begin_submit(t(0), t(0), None, FrameToken(7)).unwrap();
        core.emit(id, Ok(Some(1)));
        let flags = core.end_submit(id, Ok(())).unwrap();
        assert!(!flags.contains(InfoFlags::ASYNCHRONOUS));

        let id = core.begin_submit(t(1), t(1), None, FrameToken(8)).unwrap();
        core.emit(id, Ok(None));
        let flags = core.end_submit(id, Ok(())).unwrap();
        assert!(flags.contains(InfoFlags::FRAME_DROPPED));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].token, FrameToken(7));
        assert!(seen[1].is_dropped());
        assert_eq!(core.stats().frames_dropped, 1);
    }

    #[test]
    fn late_delivery_is_asynchronous() {
        let (core, seen) = core();
        let id = core.begin_submit(t(0), t(0), None, FrameToken(1)).unwrap();
        assert_eq!(core.end_submit(id, Ok(())).unwrap(), InfoFlags::ASYNCHRONOUS);
        assert_eq!(core.pending_count(), 1);

        let emitter = core.clone();
        thread::spawn(move || emitter.emit(id, Ok(Some(3))))
            .join()
            .unwrap();
        core.wait_for(None).unwrap();
        assert!(seen.lock()[0].flags.contains(InfoFlags::ASYNCHRONOUS));
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn timestamps_must_increase() {
        let (core, seen) = core();
        core.begin_submit(t(5), t(5), None, FrameToken(0)).unwrap();
        let err = core.begin_submit(t(5), t(5), None, FrameToken(1)).unwrap_err();
        assert_eq!(err.status(), Status::InvalidTimestamp);
        core.reset_watermark();
        core.begin_submit(t(0), t(0), None, FrameToken(2)).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn codec_error_fails_frame_once() {
        let (core, seen) = core();
        let id = core.begin_submit(t(0), t(0), None, FrameToken(4)).unwrap();
        let err = core
            .end_submit(id, Err(CodingError::CodecMalfunction("boom".into())))
            .unwrap_err();
        assert_eq!(err.status(), Status::CodecMalfunction);
        // A late emission for the same frame is ignored.
        core.emit(id, Ok(Some(1)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0].status,
            FrameStatus::Failed {
                status: Status::CodecMalfunction,
                ..
            }
        ));
    }

    #[test]
    fn unknown_frames_are_ignored() {
        let (core, seen) = core();
        core.emit(FrameId(99), Ok(Some(1)));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn drain_until_only_waits_for_earlier_frames() {
        let (core, _seen) = core();
        let a = core.begin_submit(t(0), t(0), None, FrameToken(0)).unwrap();
        core.end_submit(a, Ok(())).unwrap();
        let b = core.begin_submit(t(1), t(1), None, FrameToken(1)).unwrap();
        core.end_submit(b, Ok(())).unwrap();

        core.emit(a, Ok(Some(0)));
        core.wait_for(Some(t(0))).unwrap();
        assert_eq!(core.pending_count(), 1);
    }

    #[test]
    fn drain_timeout_reports_malfunction() {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let config = SessionConfig {
            drain_timeout_ms: Some(20),
            ..SessionConfig::default()
        };
        let core: SessionCore<u32> = SessionCore::new(
            "test",
            Arc::new(move |r: FrameResult<u32>| sink.lock().push(r)),
            &config,
        );
        let id = core.begin_submit(t(0), t(0), None, FrameToken(0)).unwrap();
        core.end_submit(id, Ok(())).unwrap();
        let err = core.wait_for(None).unwrap_err();
        assert_eq!(err.status(), Status::CodecMalfunction);
    }

    #[test]
    fn invalidated_core_rejects_submissions() {
        let (core, _seen) = core();
        assert_eq!(core.state(), SessionState::Idle);
        core.begin_submit(t(0), t(0), None, FrameToken(0)).unwrap();
        assert_eq!(core.state(), SessionState::Active);
        assert!(core.invalidate());
        assert!(!core.invalidate());
        let err = core.begin_submit(t(1), t(1), None, FrameToken(1)).unwrap_err();
        assert_eq!(err.status(), Status::InvalidSession);
    }
}
