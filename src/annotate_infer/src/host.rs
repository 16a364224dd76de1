//! The process started on a worker machine.
//!
//! It answers the host service (id 0) itself: echo and the image cache fed by the
//! scheduler's uploader. Frames for the inference service (id 1) are forwarded to a
//! backend process spawned on first use, with cached images spliced in.

use crossbeam::channel;
use std::{
    collections::HashMap,
    io::{self, BufReader, Read, Write},
    process::{Child, ChildStdin, ChildStdout},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};
use wire::{
    read_frame, Command, Frame, FrameWriter, HandlerError, ImageCache, ImageForwarder, Message,
    Multiplexer, Service, SubService, IMAGE_KEY, SERVICE_HOST, SERVICE_INFERENCE,
};
use worker_proc::Launcher;

const BACKEND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host service answering `echo`, `cache_img` and `uncache_img` from `cache`.
pub fn host_service(cache: Arc<Mutex<ImageCache>>) -> Service {
    let mut service = Service::new(SERVICE_HOST);
    let uncache = Arc::clone(&cache);
    service
        .register_handler(Command::Echo, |message| Ok(Some(message.clone())))
        .register_handler(Command::CacheImg, move |message| {
            let path = message
                .get_str(IMAGE_KEY)
                .ok_or_else(|| HandlerError::new("cache_img without img", "ProtocolError"))?;
            let size = message
                .get_u64("size")
                .ok_or_else(|| HandlerError::new("cache_img without size", "ProtocolError"))?;
            let data = message.get_bytes("data").unwrap_or_default();
            lock(&cache)
                .add_chunk(path, data, size as usize)
                .map_err(|e| HandlerError::new(e.to_string(), "CacheError"))?;
            Ok(None)
        })
        .register_handler(Command::UncacheImg, move |message| {
            if let Some(path) = message.get_str(IMAGE_KEY) {
                lock(&uncache).remove(path);
            }
            Ok(None)
        });
    service
}

/// Backend process behind a service id. Its replies go upstream unchanged.
///
/// Requests still unanswered when the backend dies are answered with a
/// `ProcessTerminated` error so callers never wait on a dead process.
pub struct ChildService {
    child: Child,
    stdin: Option<ChildStdin>,
    pending: Arc<Mutex<Pending>>,
    // Disconnects once the relay thread saw the backend's output close.
    exited: channel::Receiver<()>,
}

// Commands of forwarded requests by request id. Once closed, nothing is added.
#[derive(Default)]
struct Pending {
    requests: HashMap<u32, String>,
    closed: bool,
}

impl ChildService {
    /// Starts the backend for `service_id`, relaying its replies to `upstream`.
    pub fn spawn<W>(launcher: &Launcher, service_id: u16, upstream: FrameWriter<W>) -> wire::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let mut child = launcher.spawn()?;
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, mut stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "backend stdio not piped").into());
            }
        };
        log::info!("started backend for service {}, pid {}", service_id, child.id());
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (closed, exited) = channel::bounded(0);
        {
            let pending = Arc::clone(&pending);
            thread::spawn(move || {
                relay_replies(stdout, upstream, pending, service_id);
                drop(closed);
            });
        }
        thread::spawn(move || {
            let _ = io::copy(&mut stderr, &mut io::stderr());
        });
        Ok(ChildService {
            child,
            stdin: Some(stdin),
            pending,
            exited,
        })
    }
}

fn relay_replies<W: Write>(
    stdout: ChildStdout,
    upstream: FrameWriter<W>,
    pending: Arc<Mutex<Pending>>,
    service_id: u16,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if frame.request_id != 0 {
                    lock(&pending).requests.remove(&frame.request_id);
                }
                if let Err(e) = upstream.write_frame(&frame) {
                    log::error!("failed to relay reply upstream: {}", e);
                    break;
                }
            }
            Ok(None) => {
                log::info!("backend for service {} closed its output", service_id);
                break;
            }
            Err(e) => {
                log::error!("backend for service {} sent garbage: {}", service_id, e);
                break;
            }
        }
    }
    let orphans = {
        let mut pending = lock(&pending);
        pending.closed = true;
        std::mem::take(&mut pending.requests)
    };
    for (request_id, cmd) in orphans {
        log::warn!("request {} ({}) lost with the backend", request_id, cmd);
        let reply = Message::error_reply(&cmd, "inference process terminated", "ProcessTerminated");
        let _ = upstream.write_message(service_id, request_id, &reply);
    }
}

impl SubService for ChildService {
    fn forward(&mut self, frame: Frame) -> wire::Result<()> {
        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "backend is shut down").into()),
        };
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "backend is gone").into());
            }
            if frame.request_id != 0 {
                let cmd = frame.message().map(|m| m.cmd().to_owned()).unwrap_or_default();
                pending.requests.insert(frame.request_id, cmd);
            }
        }
        if let Err(e) = frame.write_to(stdin) {
            lock(&self.pending).requests.remove(&frame.request_id);
            return Err(e);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !lock(&self.pending).closed
    }

    fn shutdown(&mut self) {
        let mut stdin = match self.stdin.take() {
            Some(stdin) => stdin,
            None => return,
        };
        if let Ok(quit) = Frame::new(SERVICE_HOST, 0, &Message::new(Command::Quit)) {
            let _ = quit.write_to(&mut stdin);
        }
        drop(stdin);
        let exited = self.exited.recv_timeout(BACKEND_STOP_TIMEOUT);
        if let Err(channel::RecvTimeoutError::Timeout) = exited {
            log::warn!("backend ignored quit, killing it");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for ChildService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves frames from `reader` until it closes or a `quit` arrives, replying on
/// `writer`. The backend is started with `backend` when the first inference frame
/// arrives, and again after it died.
pub fn run_host<R, W>(reader: R, writer: W, backend: Launcher) -> wire::Result<()>
where
    R: Read,
    W: Write + Send + 'static,
{
    let cache = Arc::new(Mutex::new(ImageCache::new()));
    let writer = FrameWriter::new(writer);
    let mut mux = Multiplexer::new(host_service(Arc::clone(&cache)), writer.clone());
    mux.set_sub_service_spawner(SERVICE_INFERENCE, move |id| {
        let child = ChildService::spawn(&backend, id, writer.clone())?;
        let forwarder = ImageForwarder::new(Box::new(child), Arc::clone(&cache));
        Ok(Box::new(forwarder) as Box<dyn SubService>)
    });
    mux.serve(reader)
}
