//! Request orchestration: admission, dispatch, job execution, completion and
//! group accounting.
//!
//! Every state change touching a checksum happens while holding that
//! checksum's lock from [`checksum_lock::ChecksumLocks`]. Components that are
//! called with the lock already held expose `*_locked` methods.

pub mod checksum_lock;
pub mod completion;
pub mod copy;
pub mod dedup;
pub mod dispatcher;
pub mod events;
pub mod group;
pub mod job;
pub mod lease;
pub mod runtime;
pub mod scheduler;

pub use checksum_lock::*;
pub use completion::*;
pub use copy::*;
pub use dedup::*;
pub use dispatcher::*;
pub use events::*;
pub use group::*;
pub use job::*;
pub use lease::*;
pub use runtime::*;
pub use scheduler::*;
