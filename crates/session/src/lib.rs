//! `vcs-session`: Compression and decompression coding sessions.
//!
//! A session wraps one codec plugin and gives callers a uniform contract:
//!
//! - frames are submitted with strictly increasing timestamps and each one
//!   yields exactly one [`FrameResult`](vcs_common::FrameResult) on the
//!   session's [`CompletionSink`](vcs_common::CompletionSink)
//! - `complete_outstanding_work` blocks until everything submitted up to a
//!   time has been delivered
//! - properties are validated against the schema the session and codec
//!   publish
//! - invalidation drains rather than kills: frames already accepted are
//!   still delivered
//!
//! [`CompressionSession`] additionally drives multi-pass encoding against
//! a [`MultiPassStore`](vcs_common::MultiPassStore).

pub mod compression;
pub mod decompression;
pub mod lifecycle;
pub mod registry;
mod reorder;

pub use compression::{CompressionSession, MultiPassState};
pub use decompression::DecompressionSession;
pub use lifecycle::{SessionState, SessionStats};
pub use registry::{CodecRegistry, DecoderFactory, EncoderFactory};
