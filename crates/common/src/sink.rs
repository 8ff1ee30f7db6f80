//! Completion sinks: where a session delivers per-frame results.

use crossbeam::channel::Sender;

use crate::error::Status;
use crate::flags::InfoFlags;
use crate::time::MediaTime;
use crate::types::FrameToken;

/// Outcome of one submitted frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Completed,
    /// Dropped by the codec (rate control, missing reference). Recoverable.
    Dropped,
    Failed { status: Status, reason: String },
}

/// A result delivered once per submitted frame.
#[derive(Clone, Debug)]
pub struct FrameResult<T> {
    /// The caller's correlation token for the originating frame.
    pub token: FrameToken,
    pub status: FrameStatus,
    pub flags: InfoFlags,
    pub pts: MediaTime,
    pub duration: Option<MediaTime>,
    /// Present only when `status` is `Completed`.
    pub output: Option<T>,
}

impl<T> FrameResult<T> {
    pub fn is_completed(&self) -> bool {
        self.status == FrameStatus::Completed
    }

    pub fn is_dropped(&self) -> bool {
        self.status == FrameStatus::Dropped
    }
}

/// Receives frame results. Called from whichever thread completes the frame,
/// one result at a time per session.
///
/// Implementations must not call back into the session that invoked them.
pub trait CompletionSink<T>: Send + Sync {
    fn on_frame(&self, result: FrameResult<T>);
}

impl<T, F> CompletionSink<T> for F
where
    F: Fn(FrameResult<T>) + Send + Sync,
{
    fn on_frame(&self, result: FrameResult<T>) {
        self(result)
    }
}

/// Forwards results into a channel. Results are discarded once the receiver
/// is gone.
pub struct ChannelSink<T>(pub Sender<FrameResult<T>>);

impl<T: Send> CompletionSink<T> for ChannelSink<T> {
    fn on_frame(&self, result: FrameResult<T>) {
        let _ = self.0.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use parking_lot::Mutex;

    fn result(token: u64) -> FrameResult<u32> {
        FrameResult {
            token: FrameToken(token),
            status: FrameStatus::Completed,
            flags: InfoFlags::NONE,
            pts: MediaTime::new(token as i64, 30),
            duration: None,
            output: Some(7),
        }
    }

    #[test]
    fn closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |r: FrameResult<u32>| seen.lock().push(r.token);
        sink.on_frame(result(1));
        sink.on_frame(result(2));
        assert_eq!(*seen.lock(), vec![FrameToken(1), FrameToken(2)]);
    }

    #[test]
    fn channel_sink_forwards_and_tolerates_closed_receiver() {
        let (tx, rx) = channel::unbounded();
        let sink = ChannelSink(tx);
        sink.on_frame(result(4));
        let got = rx.recv().unwrap();
        assert!(got.is_completed());
        assert_eq!(got.output, Some(7));
        drop(rx);
        sink.on_frame(result(5));
    }
}
