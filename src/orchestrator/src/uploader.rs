//! Streams image files to a remote host's cache so inference on that host can start
//! from bytes it received over the protocol.

use crate::{Error, Result};
use crossbeam::channel::{self, TryRecvError};
use std::{
    collections::VecDeque,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};
use worker_proc::Handle;

/// Bytes per `cache_img` frame.
pub const CHUNK_SIZE: usize = 128 * 1024;

type FailureFn = Box<dyn FnOnce(Error) + Send>;

enum Request {
    Upload(Upload),
    Done(String),
    Stop,
}

struct Upload {
    file: PathBuf,
    key: String,
    size: usize,
    on_failure: FailureFn,
}

/// Background uploader of one host.
pub struct ImageUploader {
    handle: Handle,
    tx: channel::Sender<Request>,
    pump: Option<JoinHandle<()>>,
}

/// Cache key of a file: the path as the worker will be asked for it.
pub fn cache_key(file: &Path) -> String {
    file.to_string_lossy().into_owned()
}

impl ImageUploader {
    /// Starts the pump thread for `handle`.
    pub fn new(handle: Handle) -> Self {
        let (tx, rx) = channel::unbounded();
        let pump = {
            let handle = handle.clone();
            thread::spawn(move || Pump::new(handle, rx).run())
        };
        ImageUploader {
            handle,
            tx,
            pump: Some(pump),
        }
    }

    /// Announces `file` to the host right away, then queues its contents.
    ///
    /// The announcement goes out before this returns, so any request naming the file
    /// sent afterwards is held by the host until the upload completes. If the file
    /// cannot be read later, or its size no longer matches the announcement, the
    /// host's entry is dropped and `on_failure` is called with [`Error::Upload`].
    pub fn queue_file<F>(&self, file: &Path, on_failure: F) -> Result<()>
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let key = cache_key(file);
        let failed = |message: String| Error::Upload {
            path: key.clone(),
            message,
        };
        let metadata = fs::metadata(file).map_err(|e| failed(e.to_string()))?;
        if !metadata.is_file() {
            return Err(failed("not a regular file".into()));
        }
        let size = metadata.len() as usize;
        self.handle.announce_image(&key, size)?;
        log::debug!("{}: announced {} ({} bytes)", self.handle.host(), key, size);
        // Empty files are read too, to catch ones that grew since.
        let upload = Upload {
            file: file.to_owned(),
            key,
            size,
            on_failure: Box::new(on_failure),
        };
        let _ = self.tx.send(Request::Upload(upload));
        Ok(())
    }

    /// Cancels a pending upload of `file` and drops it from the host's cache.
    pub fn image_done(&self, file: &Path) {
        let _ = self.tx.send(Request::Done(cache_key(file)));
    }
}

impl Drop for ImageUploader {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Stop);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

struct Pump {
    handle: Handle,
    rx: channel::Receiver<Request>,
    queue: VecDeque<Upload>,
    stopped: bool,
}

enum Outcome {
    Sent,
    Cancelled,
    Failed(String),
}

impl Pump {
    fn new(handle: Handle, rx: channel::Receiver<Request>) -> Self {
        Pump {
            handle,
            rx,
            queue: VecDeque::new(),
            stopped: false,
        }
    }

    fn run(mut self) {
        while !self.stopped {
            match self.queue.pop_front() {
                Some(upload) => self.upload(upload),
                None => match self.rx.recv() {
                    Ok(request) => {
                        self.apply(request, None);
                    }
                    Err(_) => break,
                },
            }
        }
        log::debug!("{}: uploader stopped", self.handle.host());
    }

    // Returns true if `request` cancels the upload of `current`.
    fn apply(&mut self, request: Request, current: Option<&str>) -> bool {
        match request {
            Request::Upload(upload) => {
                self.queue.push_back(upload);
                false
            }
            Request::Done(key) => {
                self.queue.retain(|u| u.key != key);
                self.uncache(&key);
                current == Some(key.as_str())
            }
            Request::Stop => {
                self.stopped = true;
                true
            }
        }
    }

    fn uncache(&self, key: &str) {
        if let Err(e) = self.handle.uncache_image(key) {
            log::debug!("{}: uncache {} failed: {}", self.handle.host(), key, e);
        }
    }

    // Handles requests that arrived meanwhile. True if the upload of `key` is off.
    fn cancelled(&mut self, key: &str) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(request) => {
                    if self.apply(request, Some(key)) {
                        return true;
                    }
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    self.stopped = true;
                    return true;
                }
            }
        }
    }

    fn upload(&mut self, upload: Upload) {
        let Upload {
            file,
            key,
            size,
            on_failure,
        } = upload;
        match self.send_file(&file, &key, size) {
            Outcome::Sent => log::debug!("{}: uploaded {}", self.handle.host(), key),
            Outcome::Cancelled => {
                log::debug!("{}: upload of {} cancelled", self.handle.host(), key)
            }
            Outcome::Failed(message) => {
                log::error!("{}: upload of {} failed: {}", self.handle.host(), key, message);
                self.uncache(&key);
                on_failure(Error::Upload { path: key, message });
            }
        }
    }

    // Reads one chunk at a time; the handle blocks each send until the writer took
    // the previous chunk.
    fn send_file(&mut self, file: &Path, key: &str, size: usize) -> Outcome {
        let mut reader = match File::open(file) {
            Ok(reader) => reader,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let mut sent = 0;
        while sent < size {
            if self.cancelled(key) {
                return Outcome::Cancelled;
            }
            let len = CHUNK_SIZE.min(size - sent);
            let chunk = match read_chunk(&mut reader, len) {
                Ok(chunk) => chunk,
                Err(e) => return Outcome::Failed(e.to_string()),
            };
            if chunk.len() < len {
                let read = sent + chunk.len();
                return Outcome::Failed(format!("file shrank from {} to {} bytes", size, read));
            }
            if let Err(e) = self.handle.cache_image(key, &chunk, size) {
                return Outcome::Failed(e.to_string());
            }
            sent += len;
        }
        match reader.read(&mut [0; 1]) {
            Ok(0) => Outcome::Sent,
            Ok(_) => Outcome::Failed(format!("file grew past {} bytes", size)),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }
}

fn read_chunk(reader: &mut File, len: usize) -> io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}
