#![warn(missing_docs)]
#![warn(clippy::all)]

//! Wire protocol shared by the scheduler, the host proxy and the workers.
//!
//! Every frame is a 10 byte big-endian header `{service_id: u16, length: u32,
//! request_id: u32}` followed by `length` bytes of MessagePack. The body is always a
//! map carrying a `"cmd"` string; replies echo the `"cmd"` of the request.

mod command;
mod error;
pub mod frame;
pub mod image_cache;
mod message;
pub mod multiplexer;
pub mod service;

pub use crate::command::{Capability, Command};
pub use crate::error::{Error, Result};
pub use crate::frame::{
    read_frame, read_message, write_message, Frame, FrameWriter, SERVICE_HOST, SERVICE_INFERENCE,
};
pub use crate::image_cache::ImageCache;
pub use crate::message::{Message, IMAGE_KEY};
pub use crate::multiplexer::{Dispatch, ImageForwarder, Multiplexer, SubService};
pub use crate::service::{HandlerError, Service};
pub use rmpv::Value;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard of a poisoned lock.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
