#![warn(missing_docs)]
#![warn(clippy::all)]

//! Processes of the inference pipeline: the host proxy that runs on a worker machine,
//! a reference backend, and helpers shared by their command lines.

pub mod cli;
pub mod echo;
pub mod host;
