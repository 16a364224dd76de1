//! Reassembly of images uploaded in chunks to a host.

use crate::{Error, Result};
use std::collections::HashMap;

// Chunks arrive incrementally; do not trust a declared size for the up-front allocation.
const MAX_PREALLOC: usize = 64 * 1024 * 1024;

type Callback = Box<dyn FnOnce(&[u8]) + Send>;

struct Entry {
    data: Vec<u8>,
    total: usize,
    callbacks: Vec<Callback>,
}

impl Entry {
    fn is_complete(&self) -> bool {
        self.data.len() == self.total
    }
}

/// Per-path buffers of images being uploaded, keyed by the path the client uses.
#[derive(Default)]
pub struct ImageCache {
    entries: HashMap<String, Entry>,
}

impl ImageCache {
    /// Empty cache.
    pub fn new() -> Self {
        ImageCache::default()
    }

    /// Appends a chunk of `path`, whose full size is `total`.
    ///
    /// The first chunk (possibly empty) opens the transfer. Returns whether the image
    /// is complete afterwards. Completion callbacks run here, synchronously, on the
    /// chunk that completes the image. Receiving more than `total` bytes, or a chunk
    /// declaring another total, drops the transfer and fails.
    pub fn add_chunk(&mut self, path: &str, chunk: &[u8], total: usize) -> Result<bool> {
        let entry = self
            .entries
            .entry(path.to_owned())
            .or_insert_with(|| Entry {
                data: Vec::with_capacity(total.min(MAX_PREALLOC)),
                total,
                callbacks: vec![],
            });
        if entry.total != total {
            let expected = entry.total;
            self.entries.remove(path);
            return Err(Error::SizeMismatch {
                path: path.to_owned(),
                expected,
                declared: total,
            });
        }
        let received = entry.data.len() + chunk.len();
        if received > entry.total {
            self.entries.remove(path);
            return Err(Error::Overflow {
                path: path.to_owned(),
                received,
                total,
            });
        }
        entry.data.extend_from_slice(chunk);
        if !entry.is_complete() {
            return Ok(false);
        }
        let callbacks = std::mem::take(&mut entry.callbacks);
        if !callbacks.is_empty() {
            log::debug!("{} cached, releasing {} held request(s)", path, callbacks.len());
        }
        for callback in callbacks {
            callback(&entry.data);
        }
        Ok(true)
    }

    /// Whether a transfer for `path` was opened and not removed.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Whether every declared byte of `path` arrived.
    pub fn is_complete(&self, path: &str) -> bool {
        self.entries.get(path).map_or(false, Entry::is_complete)
    }

    /// Bytes received so far for `path`.
    pub fn received(&self, path: &str) -> Option<usize> {
        self.entries.get(path).map(|e| e.data.len())
    }

    /// The image, once complete.
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .get(path)
            .filter(|e| e.is_complete())
            .map(|e| e.data.as_slice())
    }

    /// Runs `callback` with the image bytes once `path` is complete, right away if it
    /// already is. Returns false, without running it, for an unknown path.
    pub fn on_complete<F>(&mut self, path: &str, callback: F) -> bool
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        match self.entries.get_mut(path) {
            Some(entry) if entry.is_complete() => {
                callback(&entry.data);
                true
            }
            Some(entry) => {
                entry.callbacks.push(Box::new(callback));
                true
            }
            None => false,
        }
    }

    /// Forgets `path`; callbacks still waiting on it are dropped.
    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        let entry = self.entries.remove(path)?;
        if !entry.callbacks.is_empty() {
            log::warn!(
                "{} uncached before completion, {} held request(s) dropped",
                path,
                entry.callbacks.len()
            );
        }
        Some(entry.data)
    }

    /// Number of open transfers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no transfer is open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
