#![warn(missing_docs)]
#![warn(clippy::all)]

//! Worker processes speaking the framed protocol over their standard streams.
//!
//! A [`Handle`] owns one child process, correlates requests with replies through
//! [`Promise`]s, restarts the process when a capability's config changes and turns
//! process death into [`Error::Terminated`].

pub mod config;
mod error;
mod handle;
mod launcher;
mod promise;

pub use crate::error::{Error, Result};
pub use crate::handle::Handle;
pub use crate::launcher::Launcher;
pub use crate::promise::Promise;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
