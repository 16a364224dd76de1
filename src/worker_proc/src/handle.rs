//! Facade of one worker process. Callers use Handle instead of talking to the pipes
//! themselves.
//!
//! Per process there is a writer thread, a reader thread that resolves pending
//! promises, and a thread passing stderr through to the log. Per handle there is a
//! queue thread running closures in submission order.
//!
//! The writer is fed by two lanes. Control frames (requests, setup, quit) go on an
//! unbounded lane that is always drained first. Image chunks go on a bulk lane that
//! holds a single frame, so a sender of chunks blocks at the pace of the pipe and a
//! control frame waits for at most the chunk being written.

use crate::{config, lock, Error, Launcher, Promise, Result};
use crossbeam::channel;
use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Write},
    panic::{self, AssertUnwindSafe},
    path::Path,
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};
use wire::{
    frame::FIRST_UNRESERVED_SERVICE, Capability, Command, Frame, Message, Value, IMAGE_KEY,
    SERVICE_HOST, SERVICE_INFERENCE,
};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&Handle) + Send>;
type DeathListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle for one worker process. Cloning shares the process.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    launcher: Launcher,
    stop_timeout: Duration,
    state: Mutex<State>,
    queue: channel::Sender<Job>,
    restarts: AtomicUsize,
    death_listener: Mutex<Option<DeathListener>>,
}

#[derive(Default)]
struct State {
    link: Option<Link>,
    configs: HashMap<Capability, Value>,
    generation: u64,
}

struct Link {
    child: Child,
    frames: channel::Sender<Vec<u8>>,
    bulk: channel::Sender<Vec<u8>>,
    // Disconnects when the reader thread sees the end of the worker's output.
    exited: channel::Receiver<()>,
    pending: Arc<Mutex<Pending>>,
    next_request: u32,
    generation: u64,
}

#[derive(Default)]
struct Pending {
    map: HashMap<u32, Promise<Message>>,
    closed: bool,
}

impl Link {
    fn next_request_id(&mut self) -> u32 {
        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1).max(1);
        id
    }
}

impl Handle {
    /// Handle for `host`, started lazily with `launcher`.
    pub fn new(host: impl Into<String>, launcher: Launcher) -> Self {
        Handle::with_stop_timeout(host, launcher, DEFAULT_STOP_TIMEOUT)
    }

    /// Like [`Handle::new`]; `stop` kills the process if it has not exited after
    /// `stop_timeout`.
    pub fn with_stop_timeout(
        host: impl Into<String>,
        launcher: Launcher,
        stop_timeout: Duration,
    ) -> Self {
        let (queue, jobs) = channel::unbounded::<Job>();
        let inner = Arc::new(Inner {
            host: host.into(),
            launcher,
            stop_timeout,
            state: Mutex::new(State::default()),
            queue,
            restarts: AtomicUsize::new(0),
            death_listener: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        thread::spawn(move || {
            for job in jobs.iter() {
                let handle = match weak.upgrade() {
                    Some(inner) => Handle { inner },
                    None => break,
                };
                if panic::catch_unwind(AssertUnwindSafe(|| job(&handle))).is_err() {
                    log::error!("{}: queued job panicked", handle.host());
                }
            }
        });
        Handle { inner }
    }

    /// Host name, used in logs and errors.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// How the process is started.
    pub fn launcher(&self) -> &Launcher {
        &self.inner.launcher
    }

    /// Whether a process is currently attached.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).link.is_some()
    }

    /// Restarts forced by configuration changes so far.
    pub fn restart_count(&self) -> usize {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Config last applied for `capability` on the current process.
    pub fn loaded_config(&self, capability: Capability) -> Option<Value> {
        lock(&self.inner.state).configs.get(&capability).cloned()
    }

    /// Called with the host name whenever the process dies without being stopped.
    pub fn on_death<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock(&self.inner.death_listener) = Some(Arc::new(listener));
    }

    /// Runs `job` on this handle's queue thread after every job queued before it.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce(&Handle) + Send + 'static,
    {
        if self.inner.queue.send(Box::new(job)).is_err() {
            log::error!("{}: job queue is closed", self.host());
        }
    }

    /// Like [`Handle::execute`], returning the closure's outcome as a promise.
    pub fn run<R, F>(&self, f: F) -> Promise<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(&Handle) -> Result<R> + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        let job: Job = Box::new(move |handle: &Handle| {
            match panic::catch_unwind(AssertUnwindSafe(|| f(handle))) {
                Ok(outcome) => target.complete(outcome),
                Err(_) => target.set_exception(Error::Task("job panicked".into())),
            };
        });
        if self.inner.queue.send(job).is_err() {
            promise.set_exception(Error::Task("job queue is closed".into()));
        }
        promise
    }

    /// Starts the process unless one is running. A new process has no config loaded.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        self.link(&mut state).map(|_| ())
    }

    fn link<'a>(&self, state: &'a mut State) -> Result<&'a mut Link> {
        let link = match state.link.take() {
            Some(link) => link,
            None => {
                state.configs.clear();
                state.generation += 1;
                self.spawn(state.generation)?
            }
        };
        Ok(state.link.get_or_insert(link))
    }

    fn spawn(&self, generation: u64) -> Result<Link> {
        let host = self.host().to_owned();
        let spawn_error = |message: String| Error::Spawn {
            host: host.clone(),
            message,
        };
        let mut child = self
            .inner
            .launcher
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_error("standard streams are not piped".into()));
            }
        };
        log::info!("{}: started worker, pid {}", host, child.id());

        let (frames, control) = channel::unbounded();
        let (bulk, chunks) = channel::bounded(1);
        let (closed, exited) = channel::bounded(0);
        let pending = Arc::new(Mutex::new(Pending::default()));
        {
            let host = host.clone();
            let weak = Arc::downgrade(&self.inner);
            let lanes = Lanes { control, chunks };
            thread::spawn(move || write_frames(&host, stdin, lanes, weak, generation));
        }
        {
            let host = host.clone();
            let weak = Arc::downgrade(&self.inner);
            let pending = Arc::clone(&pending);
            thread::spawn(move || {
                read_replies(&host, stdout, pending, closed, weak, generation)
            });
        }
        thread::spawn(move || pass_stderr(&host, stderr));
        Ok(Link {
            child,
            frames,
            bulk,
            exited,
            pending,
            next_request: 1,
            generation,
        })
    }

    /// Sends `message` to `service`, starting the process if needed. The promise
    /// resolves with the reply, or fails with [`Error::Terminated`] if the process
    /// goes away first.
    pub fn send(&self, service: u16, message: Message) -> Promise<Message> {
        let mut state = lock(&self.inner.state);
        let link = match self.link(&mut state) {
            Ok(link) => link,
            Err(e) => return Promise::failed(e),
        };
        let request_id = link.next_request_id();
        let frame = match Frame::new(service, request_id, &message) {
            Ok(frame) => frame,
            Err(e) => return Promise::failed(e.into()),
        };
        let promise = Promise::new();
        {
            let mut pending = lock(&link.pending);
            if pending.closed {
                return Promise::failed(Error::Terminated);
            }
            pending.map.insert(request_id, promise.clone());
        }
        if link.frames.send(frame.to_bytes()).is_err() {
            lock(&link.pending).map.remove(&request_id);
            return Promise::failed(Error::Terminated);
        }
        log::trace!("{}: sent {} as request {}", self.host(), message.cmd(), request_id);
        promise
    }

    /// Sends `message` to `service` without expecting a reply.
    pub fn notify(&self, service: u16, message: Message) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let link = self.link(&mut state)?;
        let frame = Frame::new(service, 0, &message)?;
        link.frames
            .send(frame.to_bytes())
            .map_err(|_| Error::Terminated)
    }

    /// Loads `config` for `capability`.
    ///
    /// If the process already loaded a config of a different identity for this
    /// capability, it is restarted first. Blocks for the worker's answer. A rejected
    /// setup stops the process so a retry starts clean.
    pub fn setup(&self, capability: Capability, config: Value) -> Result<()> {
        let loaded = self.loaded_config(capability);
        if loaded.as_ref() == Some(&config) {
            return Ok(());
        }
        if let Some(loaded) = loaded {
            if config::identity(capability, &loaded) != config::identity(capability, &config) {
                log::info!("{}: {} config changed, restarting worker", self.host(), capability);
                self.stop();
                self.inner.restarts.fetch_add(1, Ordering::SeqCst);
            }
        }
        let mut message = Message::new(Command::Setup(capability));
        message
            .extend_from(&config)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let reply = self.send(SERVICE_INFERENCE, message).result()?;
        if let Some((message, kind)) = reply.error() {
            let error = Error::Setup {
                host: self.host().to_owned(),
                capability,
                message: message.to_owned(),
                kind: kind.to_owned(),
            };
            log::warn!("{}", error);
            self.stop();
            return Err(error);
        }
        let mut state = lock(&self.inner.state);
        if state.link.is_some() {
            state.configs.insert(capability, config);
        }
        Ok(())
    }

    /// [`Handle::setup`] for captioning.
    pub fn setup_caption(&self, config: Value) -> Result<()> {
        self.setup(Capability::Caption, config)
    }

    /// [`Handle::setup`] for tagging.
    pub fn setup_tag(&self, config: Value) -> Result<()> {
        self.setup(Capability::Tag, config)
    }

    /// [`Handle::setup`] for segmentation.
    pub fn setup_mask(&self, config: Value) -> Result<()> {
        self.setup(Capability::Mask, config)
    }

    /// [`Handle::setup`] for embeddings.
    pub fn setup_embed(&self, config: Value) -> Result<()> {
        self.setup(Capability::Embed, config)
    }

    /// [`Handle::setup`] for upscaling.
    pub fn setup_upscale(&self, config: Value) -> Result<()> {
        self.setup(Capability::Upscale, config)
    }

    /// Calls `command` on the inference service with the fields of the `args` map.
    ///
    /// The promise resolves with the command's payload field. An error reply fails it
    /// with [`Error::Inference`] and leaves the process running.
    pub fn call(&self, command: Command, args: Value) -> Promise<Value> {
        let mut message = Message::new(command);
        if let Err(e) = message.extend_from(&args) {
            return Promise::failed(Error::Protocol(e.to_string()));
        }
        self.request(command, message)
    }

    fn request(&self, command: Command, message: Message) -> Promise<Value> {
        let host = self.host().to_owned();
        self.send(SERVICE_INFERENCE, message)
            .map(move |reply| payload(&host, command, reply))
    }

    fn image_call(&self, command: Command, img: &Path, args: Value) -> Promise<Value> {
        let mut message = Message::new(command);
        if let Err(e) = message.extend_from(&args) {
            return Promise::failed(Error::Protocol(e.to_string()));
        }
        message.set(IMAGE_KEY, img.to_string_lossy().into_owned());
        self.request(command, message)
    }

    /// Captions of `img`.
    pub fn caption(&self, img: &Path, args: Value) -> Promise<Value> {
        self.image_call(Command::Caption, img, args)
    }

    /// Tags of `img`.
    pub fn tag(&self, img: &Path, args: Value) -> Promise<Value> {
        self.image_call(Command::Tag, img, args)
    }

    /// Segmentation mask of `img`.
    pub fn mask(&self, img: &Path, args: Value) -> Promise<Value> {
        self.image_call(Command::Mask, img, args)
    }

    /// Detection boxes of `img`.
    pub fn mask_boxes(&self, img: &Path, args: Value) -> Promise<Value> {
        self.image_call(Command::MaskBoxes, img, args)
    }

    /// Embedding of `img`.
    pub fn embed_img(&self, img: &Path, args: Value) -> Promise<Value> {
        self.image_call(Command::EmbedImg, img, args)
    }

    /// Upscaled `img`.
    pub fn imgfile_upscale(&self, img: &Path, args: Value) -> Promise<Value> {
        self.image_call(Command::ImgfileUpscale, img, args)
    }

    /// Embedding of `text`.
    pub fn embed_text(&self, text: &str) -> Promise<Value> {
        self.request(Command::EmbedText, Message::new(Command::EmbedText).with("text", text))
    }

    /// Token boundaries of `text` under the loaded caption model.
    pub fn token_count_borders(&self, text: &str, args: Value) -> Promise<Value> {
        let mut message = Message::new(Command::TokenCountBorders);
        if let Err(e) = message.extend_from(&args) {
            return Promise::failed(Error::Protocol(e.to_string()));
        }
        message.set("text", text);
        self.request(Command::TokenCountBorders, message)
    }

    /// Round trip of `data` through the worker.
    pub fn echo(&self, data: Value) -> Promise<Value> {
        self.request(Command::Echo, Message::new(Command::Echo).with("data", data))
    }

    /// Announces an image of `total` bytes to the host side image cache.
    ///
    /// Travels on the control lane, so it reaches the host before any request sent
    /// after it that names `path`.
    pub fn announce_image(&self, path: &str, total: usize) -> Result<()> {
        self.notify(SERVICE_HOST, cache_img(path, &[], total))
    }

    /// Sends one chunk of `path` to the host side image cache on the bulk lane.
    /// Blocks while the previous chunk has not been taken by the writer.
    pub fn cache_image(&self, path: &str, chunk: &[u8], total: usize) -> Result<()> {
        self.send_bulk(&cache_img(path, chunk, total))
    }

    /// Drops `path` from the host side image cache. Does nothing without a process.
    ///
    /// Queued behind chunks already handed to [`Handle::cache_image`], so a late
    /// chunk cannot bring the entry back.
    pub fn uncache_image(&self, path: &str) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.send_bulk(&Message::new(Command::UncacheImg).with(IMAGE_KEY, path))
    }

    fn send_bulk(&self, message: &Message) -> Result<()> {
        let frame = Frame::new(SERVICE_HOST, 0, message)?;
        // The lane is cloned so a blocked send does not hold the state lock.
        let bulk = {
            let mut state = lock(&self.inner.state);
            self.link(&mut state)?.bulk.clone()
        };
        bulk.send(frame.to_bytes()).map_err(|_| Error::Terminated)
    }

    /// Asks the process to quit, closes its input and kills it if it is still alive
    /// after the stop timeout. Pending promises fail with [`Error::Terminated`].
    pub fn stop(&self) {
        let link = {
            let mut state = lock(&self.inner.state);
            state.configs.clear();
            state.link.take()
        };
        if let Some(link) = link {
            self.inner.shut_down(link);
        }
    }

    /// Kills the process right away.
    pub fn kill(&self) {
        let link = {
            let mut state = lock(&self.inner.state);
            state.configs.clear();
            state.link.take()
        };
        if let Some(mut link) = link {
            log::info!("{}: killing worker", self.host());
            let _ = link.child.kill();
            let _ = link.child.wait();
        }
    }
}

impl Inner {
    fn shut_down(&self, link: Link) {
        let Link {
            mut child,
            frames,
            bulk,
            exited,
            ..
        } = link;
        if let Ok(quit) = Frame::new(SERVICE_HOST, 0, &Message::new(Command::Quit)) {
            let _ = frames.send(quit.to_bytes());
        }
        drop(frames);
        drop(bulk);
        match exited.recv_timeout(self.stop_timeout) {
            Err(channel::RecvTimeoutError::Timeout) => {
                log::warn!("{}: worker ignored quit, killing it", self.host);
                let _ = child.kill();
            }
            _ => log::debug!("{}: worker closed its output", self.host),
        }
        match child.wait() {
            Ok(status) => log::info!("{}: worker exited with {}", self.host, status),
            Err(e) => log::warn!("{}: failed to wait for worker: {}", self.host, e),
        }
    }

    fn on_disconnect(&self, generation: u64, reason: &str) {
        let link = {
            let mut state = lock(&self.state);
            match &state.link {
                Some(link) if link.generation == generation => {
                    state.configs.clear();
                    state.link.take()
                }
                _ => None,
            }
        };
        let mut link = match link {
            Some(link) => link,
            None => return,
        };
        log::warn!("{}: lost worker: {}", self.host, reason);
        let _ = link.child.kill();
        let _ = link.child.wait();
        let listener = lock(&self.death_listener).clone();
        if let Some(listener) = listener {
            listener(&self.host);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut link) = state.link.take() {
            log::debug!("{}: handle dropped, killing worker", self.host);
            let _ = link.child.kill();
            let _ = link.child.wait();
        }
    }
}

fn payload(host: &str, command: Command, reply: Message) -> Result<Value> {
    if let Some((message, kind)) = reply.error() {
        return Err(Error::Inference {
            host: host.to_owned(),
            message: message.to_owned(),
            kind: kind.to_owned(),
        });
    }
    let key = command.payload_key().unwrap_or("data");
    reply
        .get(key)
        .cloned()
        .ok_or_else(|| Error::Protocol(format!("{} reply has no \"{}\" field", command, key)))
}

fn cache_img(path: &str, chunk: &[u8], total: usize) -> Message {
    Message::new(Command::CacheImg)
        .with(IMAGE_KEY, path)
        .with("data", Value::Binary(chunk.to_vec()))
        .with("size", total as u64)
}

struct Lanes {
    control: channel::Receiver<Vec<u8>>,
    chunks: channel::Receiver<Vec<u8>>,
}

impl Lanes {
    // Control frames first. None once the control lane is closed and drained.
    fn next(&self) -> Option<Vec<u8>> {
        match self.control.try_recv() {
            Ok(bytes) => return Some(bytes),
            Err(channel::TryRecvError::Disconnected) => return None,
            Err(channel::TryRecvError::Empty) => {}
        }
        channel::select! {
            recv(self.control) -> bytes => bytes.ok(),
            recv(self.chunks) -> bytes => match bytes {
                Ok(bytes) => Some(bytes),
                Err(_) => self.control.recv().ok(),
            },
        }
    }
}

fn write_frames(
    host: &str,
    mut stdin: ChildStdin,
    lanes: Lanes,
    inner: Weak<Inner>,
    generation: u64,
) {
    while let Some(bytes) = lanes.next() {
        if let Err(e) = stdin.write_all(&bytes).and_then(|_| stdin.flush()) {
            log::error!("{}: write to worker failed: {}", host, e);
            if let Some(inner) = inner.upgrade() {
                inner.on_disconnect(generation, &e.to_string());
            }
            return;
        }
    }
}

fn read_replies(
    host: &str,
    stdout: ChildStdout,
    pending: Arc<Mutex<Pending>>,
    closed: channel::Sender<()>,
    inner: Weak<Inner>,
    generation: u64,
) {
    let mut reader = BufReader::new(stdout);
    let reason = loop {
        match wire::read_message(&mut reader) {
            Ok(Some((service_id, request_id, reply))) => {
                if service_id >= FIRST_UNRESERVED_SERVICE {
                    log::warn!("{}: reply from unexpected service {}", host, service_id);
                }
                if request_id == 0 {
                    log::debug!("{}: ignoring unsolicited {}", host, reply.cmd());
                    continue;
                }
                let promise = lock(&pending).map.remove(&request_id);
                match promise {
                    Some(promise) => {
                        promise.set_result(reply);
                    }
                    None => log::warn!("{}: reply to unknown request {}", host, request_id),
                }
            }
            Ok(None) => break "worker closed its output".to_owned(),
            Err(e) => break e.to_string(),
        }
    };
    drop(closed);
    let orphans = {
        let mut pending = lock(&pending);
        pending.closed = true;
        std::mem::take(&mut pending.map)
    };
    // The death listener runs before callers learn of the lost requests.
    if let Some(inner) = inner.upgrade() {
        inner.on_disconnect(generation, &reason);
    }
    if !orphans.is_empty() {
        log::debug!("{}: failing {} pending request(s)", host, orphans.len());
    }
    for (_, promise) in orphans {
        promise.set_exception(Error::Terminated);
    }
}

fn pass_stderr(host: &str, stderr: ChildStderr) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) => log::info!("[{}] {}", host, line),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::sync::mpsc;

    // `cat` echoes every frame, so each request is answered with itself.
    fn mirror() -> Handle {
        let launcher = Launcher::local("cat", Vec::<String>::new());
        Handle::with_stop_timeout("mirror", launcher, Duration::from_secs(1))
    }

    fn config(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::from(*k), v.clone()))
                .collect(),
        )
    }

    #[test]
    #[serial]
    fn test_echo_starts_lazily() {
        let handle = mirror();
        assert!(!handle.is_running());
        let data = Value::Array(vec![Value::from(1), Value::Binary(vec![1, 2, 3])]);
        assert_eq!(handle.echo(data.clone()).result(), Ok(data));
        assert!(handle.is_running());
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    #[serial]
    fn test_restart_only_on_identity_change() {
        let handle = mirror();
        let a = config(&[("model", Value::from("a")), ("sampling", Value::from(0.5))]);
        let a_resampled = config(&[("model", Value::from("a")), ("sampling", Value::from(0.9))]);
        let b = config(&[("model", Value::from("b"))]);
        handle.setup_caption(a.clone()).unwrap();
        handle.setup_caption(a.clone()).unwrap();
        assert_eq!(handle.restart_count(), 0);
        handle.setup_caption(a_resampled.clone()).unwrap();
        assert_eq!(handle.restart_count(), 0);
        assert_eq!(handle.loaded_config(Capability::Caption), Some(a_resampled));
        handle.setup_caption(b.clone()).unwrap();
        assert_eq!(handle.restart_count(), 1);
        assert_eq!(handle.loaded_config(Capability::Caption), Some(b));
        handle.stop();
    }

    #[test]
    #[serial]
    fn test_setup_error_stops_process() {
        let handle = mirror();
        let rejected = config(&[
            ("error", Value::from("no such model")),
            ("error_type", Value::from("SetupError")),
        ]);
        match handle.setup_tag(rejected) {
            Err(Error::Setup { capability, message, kind, .. }) => {
                assert_eq!(capability, Capability::Tag);
                assert_eq!(message, "no such model");
                assert_eq!(kind, "SetupError");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!handle.is_running());
        assert_eq!(handle.loaded_config(Capability::Tag), None);
    }

    #[test]
    #[serial]
    fn test_inference_error_keeps_process() {
        let handle = mirror();
        let failing = config(&[("error", Value::from("bad image"))]);
        match handle.caption(Path::new("x.png"), failing).result() {
            Err(Error::Inference { message, kind, .. }) => {
                assert_eq!(message, "bad image");
                assert_eq!(kind, "Error");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(handle.is_running());
        let captions = config(&[("captions", Value::Array(vec![Value::from("a cat")]))]);
        assert_eq!(
            handle.caption(Path::new("x.png"), captions).result(),
            Ok(Value::Array(vec![Value::from("a cat")]))
        );
        handle.stop();
    }

    #[test]
    #[serial]
    fn test_kill_fails_pending() {
        let handle = Handle::new("sleeper", Launcher::remote("exec sleep 30"));
        let promise = handle.echo(Value::from(1));
        assert!(!promise.is_done());
        handle.kill();
        assert_eq!(promise.result(), Err(Error::Terminated));
        assert!(!handle.is_running());
    }

    #[test]
    #[serial]
    fn test_unexpected_death_notifies_and_respawns() {
        let handle = Handle::new("fragile", Launcher::remote("head -c 1 >/dev/null"));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        handle.on_death(move |host| tx.lock().unwrap().send(host.to_owned()).unwrap());
        assert_eq!(handle.echo(Value::from(1)).result(), Err(Error::Terminated));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fragile");
        assert!(!handle.is_running());
        assert_eq!(handle.echo(Value::from(2)).result(), Err(Error::Terminated));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fragile");
    }

    #[test]
    #[serial]
    fn test_control_frames_overtake_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("wire.bin");
        // Nothing reads the pipe for a while, so chunks back up behind it.
        let launcher = Launcher::remote(format!("sleep 0.5; cat > '{}'", capture.display()));
        let handle = Handle::with_stop_timeout("slow", launcher, Duration::from_secs(5));
        handle.start().unwrap();
        let chunks = 64;
        let upload = {
            let handle = handle.clone();
            thread::spawn(move || {
                let chunk = vec![7u8; 128 * 1024];
                for _ in 0..chunks {
                    handle.cache_image("big.png", &chunk, chunks * chunk.len()).unwrap();
                }
            })
        };
        thread::sleep(Duration::from_millis(100));
        handle.notify(SERVICE_HOST, Message::new(Command::Echo)).unwrap();
        upload.join().unwrap();
        handle.stop();

        let mut reader = BufReader::new(std::fs::File::open(&capture).unwrap());
        let mut commands = vec![];
        while let Some((_, _, message)) = wire::read_message(&mut reader).unwrap() {
            commands.push(message.cmd().to_owned());
        }
        let echo = commands.iter().position(|cmd| cmd == "echo").unwrap();
        assert!(echo < 8, "echo written after {} frames", echo);
        let written = commands.iter().filter(|cmd| *cmd == "cache_img").count();
        assert!(written > echo + chunks / 2);
    }

    #[test]
    #[serial]
    fn test_stop_kills_worker_ignoring_quit() {
        let handle = Handle::with_stop_timeout(
            "stubborn",
            Launcher::remote("exec sleep 30"),
            Duration::from_millis(200),
        );
        handle.start().unwrap();
        let started = std::time::Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!handle.is_running());
    }

    #[test]
    fn test_spawn_failure() {
        let launcher = Launcher::local("/nonexistent/worker", Vec::<String>::new());
        let handle = Handle::new("ghost", launcher);
        assert!(matches!(handle.start(), Err(Error::Spawn { .. })));
        assert!(matches!(handle.echo(Value::Nil).result(), Err(Error::Spawn { .. })));
    }

    #[test]
    fn test_run_keeps_order() {
        let handle = Handle::new("queue", Launcher::remote("true"));
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            handle.execute(move |_| tx.send(i).unwrap());
        }
        let last = handle.run(|h| Ok(h.host().to_owned()));
        assert_eq!(last.result(), Ok("queue".to_owned()));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        let panicking: Promise<()> = handle.run(|_| panic!("boom"));
        assert!(matches!(panicking.result(), Err(Error::Task(_))));
    }
}
