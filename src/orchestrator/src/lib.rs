#![warn(missing_docs)]
#![warn(clippy::all)]

//! Schedules per-file inference jobs over a pool of worker hosts.
//!
//! A [`HostPool`] hands out [`Session`]s holding exclusive reservations on hosts. A
//! session prepares its hosts, then [`Session::queue_files`] spreads files over them
//! by priority and load, never exceeding a host's queue size, and yields results as
//! they complete.

mod builder;
mod chain;
mod error;
mod pool;
mod proc_state;
mod session;
mod uploader;

pub use crate::builder::{Builder, HostConfig};
pub use crate::chain::{Calls, Check, CheckFn, InferenceChain, ResultFn, Task};
pub use crate::error::{Error, Result};
pub use crate::pool::HostPool;
pub use crate::proc_state::ProcState;
pub use crate::session::{AbortHandle, QueueFiles, QueuedResult, Session};
pub use crate::uploader::{cache_key, ImageUploader, CHUNK_SIZE};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
