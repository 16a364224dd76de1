use crate::{HostConfig, ImageUploader, Task};
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
};
use worker_proc::Handle;

/// Scheduling state of one reserved host.
pub struct ProcState {
    pub(crate) handle: Handle,
    pub(crate) priority: f32,
    pub(crate) queue_size: usize,
    pub(crate) queued_files: HashMap<u64, PathBuf>,
    pub(crate) waiting: VecDeque<(u64, Task)>,
    pub(crate) busy: bool,
    pub(crate) uploader: Option<ImageUploader>,
}

impl ProcState {
    pub(crate) fn new(config: &HostConfig, handle: Handle) -> Self {
        let uploader = if config.upload_images {
            Some(ImageUploader::new(handle.clone()))
        } else {
            None
        };
        ProcState {
            handle,
            priority: config.priority,
            queue_size: config.queue_size,
            queued_files: HashMap::new(),
            waiting: VecDeque::new(),
            busy: false,
            uploader,
        }
    }

    /// The host's worker.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Host priority.
    pub fn priority(&self) -> f32 {
        self.priority
    }

    /// Files between queuing and completion on this host.
    pub fn queued(&self) -> usize {
        self.queued_files.len()
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.queued_files.len() < self.queue_size
    }
}
