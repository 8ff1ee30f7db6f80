//! `vcs-multipass`: Durable storage for multi-pass encoding.
//!
//! - [`MultiPassStorage`]: timestamp-keyed scratch data an encoder keeps
//!   between passes (implements [`vcs_common::MultiPassStore`])
//! - [`FrameSilo`]: the compressed samples of every pass, merged so that a
//!   later pass replaces the samples of the time ranges it re-encodes
//!
//! Both live in a backing directory: an explicit location that is kept, or
//! a temporary directory removed on release (see [`Backing`]).

pub mod backing;
pub mod silo;
pub mod storage;

pub use backing::Backing;
pub use silo::FrameSilo;
pub use storage::MultiPassStorage;
