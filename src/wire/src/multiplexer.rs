//! Routes frames by service id.
//!
//! Frames for the local service are decoded and dispatched; frames for any other id
//! go, undecoded, to a sub-service that is spawned on first use. This lets a host
//! process proxy an entire nested inference process without understanding its
//! commands.

use crate::{
    frame::FIRST_UNRESERVED_SERVICE, lock, read_frame, Command, Frame, FrameWriter, ImageCache,
    Message, Result, Service, IMAGE_KEY,
};
use rmpv::Value;
use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::{Arc, Mutex},
};

/// A nested endpoint that takes raw frames.
pub trait SubService: Send {
    /// Delivers one frame. Replies travel back on their own.
    fn forward(&mut self, frame: Frame) -> Result<()>;

    /// False once the endpoint died; the multiplexer then spawns a replacement.
    fn is_alive(&self) -> bool {
        true
    }

    /// Ends the endpoint.
    fn shutdown(&mut self) {}
}

type Spawner = Box<dyn FnMut(u16) -> Result<Box<dyn SubService>> + Send>;

/// Outcome of [`Multiplexer::handle_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handled by the local service.
    Local,
    /// Passed to a sub-service.
    Forwarded,
    /// No route; an error reply was sent if one was expected.
    Dropped,
    /// A `quit` arrived; stop serving.
    Quit,
}

/// Local service plus lazily spawned sub-services sharing one stream.
pub struct Multiplexer<W> {
    local: Service,
    writer: FrameWriter<W>,
    spawners: HashMap<u16, Spawner>,
    services: HashMap<u16, Box<dyn SubService>>,
}

impl<W: Write> Multiplexer<W> {
    /// Serves `local`, replying through `writer`.
    pub fn new(local: Service, writer: FrameWriter<W>) -> Self {
        Multiplexer {
            local,
            writer,
            spawners: HashMap::new(),
            services: HashMap::new(),
        }
    }

    /// The writer replies go to, for sub-services that answer on the same stream.
    pub fn writer(&self) -> &FrameWriter<W> {
        &self.writer
    }

    /// Registers how to create the sub-service for `id` when its first frame arrives.
    pub fn set_sub_service_spawner<F>(&mut self, id: u16, spawner: F)
    where
        F: FnMut(u16) -> Result<Box<dyn SubService>> + Send + 'static,
    {
        self.spawners.insert(id, Box::new(spawner));
    }

    /// Whether the sub-service for `id` is currently running.
    pub fn has_sub_service(&self, id: u16) -> bool {
        self.services.contains_key(&id)
    }

    /// Dispatches one complete frame.
    ///
    /// Errors are transport errors on the local stream and end the connection.
    /// Sub-service failures are answered with an error reply instead.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Dispatch> {
        if frame.service_id == self.local.id() {
            let message = frame.message()?;
            if message.command() == Some(Command::Quit) {
                return Ok(Dispatch::Quit);
            }
            match self.local.handle_message(&message) {
                Some(reply) if frame.request_id != 0 => {
                    self.writer
                        .write_message(frame.service_id, frame.request_id, &reply)?;
                }
                Some(reply) => {
                    if let Some((reason, kind)) = reply.error() {
                        log::warn!("{} failed: {}: {}", message.cmd(), kind, reason);
                    }
                }
                None => {}
            }
            return Ok(Dispatch::Local);
        }
        self.forward(frame)
    }

    fn forward(&mut self, frame: Frame) -> Result<Dispatch> {
        let id = frame.service_id;
        if self.services.get(&id).map_or(false, |s| !s.is_alive()) {
            log::warn!("sub-service {} went away, respawning", id);
            if let Some(mut service) = self.services.remove(&id) {
                service.shutdown();
            }
        }
        if !self.services.contains_key(&id) {
            let spawner = match self.spawners.get_mut(&id) {
                Some(spawner) => spawner,
                None => return self.drop_unrouted(frame),
            };
            log::info!("spawning sub-service {}", id);
            match spawner(id) {
                Ok(service) => {
                    self.services.insert(id, service);
                }
                Err(e) => {
                    log::error!("failed to spawn sub-service {}: {}", id, e);
                    return self.reject(&frame, &e.to_string(), "SpawnError");
                }
            }
        }
        let request_id = frame.request_id;
        let result = match self.services.get_mut(&id) {
            Some(service) => service.forward(frame.clone()),
            None => Ok(()),
        };
        match result {
            Ok(()) => Ok(Dispatch::Forwarded),
            Err(e) => {
                log::error!("sub-service {} failed on request {}: {}", id, request_id, e);
                if let Some(mut service) = self.services.remove(&id) {
                    service.shutdown();
                }
                self.reject(&frame, &e.to_string(), "ProcessTerminated")
            }
        }
    }

    fn drop_unrouted(&mut self, frame: Frame) -> Result<Dispatch> {
        let id = frame.service_id;
        if id >= FIRST_UNRESERVED_SERVICE {
            log::warn!("unexpected service id {} (request {})", id, frame.request_id);
        } else {
            let message = frame.message().ok();
            if message.and_then(|m| m.command()) == Some(Command::Quit) {
                return Ok(Dispatch::Quit);
            }
            log::warn!("no service registered for id {}", id);
        }
        self.reject(&frame, &format!("no service with id {}", id), "UnknownService")
    }

    fn reject(&self, frame: &Frame, reason: &str, kind: &str) -> Result<Dispatch> {
        if frame.request_id != 0 {
            let cmd = frame
                .message()
                .map(|m| m.cmd().to_owned())
                .unwrap_or_default();
            let reply = Message::error_reply(&cmd, reason, kind);
            self.writer
                .write_message(frame.service_id, frame.request_id, &reply)?;
        }
        Ok(Dispatch::Dropped)
    }

    /// Reads and dispatches frames until end of stream or `quit`, then shuts the
    /// sub-services down.
    pub fn serve<R: Read>(&mut self, mut reader: R) -> Result<()> {
        let result = loop {
            match read_frame(&mut reader) {
                Ok(Some(frame)) => match self.handle_frame(frame) {
                    Ok(Dispatch::Quit) => {
                        log::info!("quit received");
                        break Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => break Err(e),
                },
                Ok(None) => {
                    log::info!("input closed");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    /// Shuts every running sub-service down.
    pub fn shutdown(&mut self) {
        for (id, mut service) in self.services.drain() {
            log::debug!("shutting down sub-service {}", id);
            service.shutdown();
        }
    }
}

/// Sub-service wrapper that resolves `"img"` references against an [`ImageCache`].
///
/// A request naming an image that is still uploading is held and forwarded from the
/// completing chunk, with the bytes spliced into `"img"`. Requests naming anything
/// else pass through untouched.
pub struct ImageForwarder {
    inner: Arc<Mutex<Box<dyn SubService>>>,
    cache: Arc<Mutex<ImageCache>>,
}

impl ImageForwarder {
    /// Wraps `inner`, reading images from `cache`.
    pub fn new(inner: Box<dyn SubService>, cache: Arc<Mutex<ImageCache>>) -> Self {
        ImageForwarder {
            inner: Arc::new(Mutex::new(inner)),
            cache,
        }
    }
}

fn splice(frame: &Frame, mut message: Message, image: &[u8]) -> Result<Frame> {
    message.set(IMAGE_KEY, Value::Binary(image.to_vec()));
    Frame::new(frame.service_id, frame.request_id, &message)
}

impl SubService for ImageForwarder {
    fn forward(&mut self, frame: Frame) -> Result<()> {
        let message = frame.message()?;
        let key = match message.get_str(IMAGE_KEY) {
            Some(key) => key.to_owned(),
            None => return lock(&self.inner).forward(frame),
        };
        let mut cache = lock(&self.cache);
        if !cache.contains(&key) {
            drop(cache);
            return lock(&self.inner).forward(frame);
        }
        if let Some(image) = cache.get(&key) {
            let spliced = splice(&frame, message, image)?;
            drop(cache);
            return lock(&self.inner).forward(spliced);
        }
        log::debug!("holding request {} until {} is cached", frame.request_id, key);
        let inner = Arc::clone(&self.inner);
        cache.on_complete(&key, move |image| {
            let result = splice(&frame, message, image).and_then(|f| lock(&inner).forward(f));
            if let Err(e) = result {
                log::error!("failed to forward held request {}: {}", frame.request_id, e);
            }
        });
        Ok(())
    }

    fn is_alive(&self) -> bool {
        lock(&self.inner).is_alive()
    }

    fn shutdown(&mut self) {
        lock(&self.inner).shutdown()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{read_message, write_message, HandlerError, SERVICE_HOST, SERVICE_INFERENCE};
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Frame>>>,
    }

    impl SubService for Recorder {
        fn forward(&mut self, frame: Frame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn host_service(cache: Arc<Mutex<ImageCache>>) -> Service {
        let mut service = Service::new(SERVICE_HOST);
        service
            .register_handler(Command::Echo, |m| Ok(Some(m.clone())))
            .register_handler(Command::CacheImg, move |m| {
                let path = m.get_str("img").unwrap_or_default();
                let data = m.get_bytes("data").unwrap_or_default();
                let size = m.get_u64("size").unwrap_or_default() as usize;
                cache
                    .lock()
                    .unwrap()
                    .add_chunk(path, data, size)
                    .map_err(|e| HandlerError::new(e.to_string(), "CacheError"))?;
                Ok(None)
            });
        service
    }

    fn replies(writer: &FrameWriter<Vec<u8>>) -> Vec<(u16, u32, Message)> {
        let bytes = writer.inner.lock().unwrap().clone();
        let mut cursor = Cursor::new(bytes);
        let mut out = vec![];
        while let Some(reply) = read_message(&mut cursor).unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn test_local_dispatch_and_quit() {
        let writer = FrameWriter::new(vec![]);
        let cache = Arc::new(Mutex::new(ImageCache::new()));
        let mut mux = Multiplexer::new(host_service(cache), writer.clone());
        let echo = Frame::new(SERVICE_HOST, 9, &Message::new(Command::Echo).with("data", 1)).unwrap();
        assert_eq!(mux.handle_frame(echo).unwrap(), Dispatch::Local);
        let quit = Frame::new(SERVICE_HOST, 0, &Message::new(Command::Quit)).unwrap();
        assert_eq!(mux.handle_frame(quit).unwrap(), Dispatch::Quit);
        let replies = replies(&writer);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1, 9);
        assert_eq!(replies[0].2.get_u64("data"), Some(1));
    }

    #[test]
    fn test_lazy_spawn_forwards_raw_frames() {
        let writer = FrameWriter::new(vec![]);
        let cache = Arc::new(Mutex::new(ImageCache::new()));
        let mut mux = Multiplexer::new(host_service(cache), writer);
        let recorder = Recorder::default();
        let spawned = Arc::new(Mutex::new(0));
        {
            let recorder = recorder.clone();
            let spawned = Arc::clone(&spawned);
            mux.set_sub_service_spawner(SERVICE_INFERENCE, move |_| {
                *spawned.lock().unwrap() += 1;
                Ok(Box::new(recorder.clone()) as Box<dyn SubService>)
            });
        }
        assert!(!mux.has_sub_service(SERVICE_INFERENCE));
        for request_id in 1..=3 {
            let frame =
                Frame::new(SERVICE_INFERENCE, request_id, &Message::new(Command::Tag)).unwrap();
            assert_eq!(mux.handle_frame(frame).unwrap(), Dispatch::Forwarded);
        }
        assert_eq!(*spawned.lock().unwrap(), 1);
        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.iter().map(|f| f.request_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_unrouted_frames_get_error_replies() {
        let writer = FrameWriter::new(vec![]);
        let cache = Arc::new(Mutex::new(ImageCache::new()));
        let mut mux = Multiplexer::new(host_service(cache), writer.clone());
        let stray = Frame::new(300, 4, &Message::new(Command::Caption)).unwrap();
        assert_eq!(mux.handle_frame(stray).unwrap(), Dispatch::Dropped);
        let notify = Frame::new(7, 0, &Message::new(Command::Caption)).unwrap();
        assert_eq!(mux.handle_frame(notify).unwrap(), Dispatch::Dropped);
        let replies = replies(&writer);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, 300);
        assert_eq!(replies[0].2.error().map(|e| e.1), Some("UnknownService"));
    }

    #[test]
    fn test_held_request_is_spliced_on_completion() {
        let writer = FrameWriter::new(vec![]);
        let cache = Arc::new(Mutex::new(ImageCache::new()));
        let mut mux = Multiplexer::new(host_service(Arc::clone(&cache)), writer);
        let recorder = Recorder::default();
        {
            let recorder = recorder.clone();
            let cache = Arc::clone(&cache);
            mux.set_sub_service_spawner(SERVICE_INFERENCE, move |_| {
                let forwarder = ImageForwarder::new(Box::new(recorder.clone()), Arc::clone(&cache));
                Ok(Box::new(forwarder) as Box<dyn SubService>)
            });
        }
        let chunk = |data: &[u8]| {
            let message = Message::new(Command::CacheImg)
                .with("img", "/remote/cat.png")
                .with("data", Value::Binary(data.to_vec()))
                .with("size", 6);
            Frame::new(SERVICE_HOST, 0, &message).unwrap()
        };
        mux.handle_frame(chunk(&[])).unwrap();
        let caption = Message::new(Command::Caption).with("img", "/remote/cat.png");
        mux.handle_frame(Frame::new(SERVICE_INFERENCE, 5, &caption).unwrap())
            .unwrap();
        let plain = Message::new(Command::Caption).with("img", "/local/dog.png");
        mux.handle_frame(Frame::new(SERVICE_INFERENCE, 6, &plain).unwrap())
            .unwrap();
        assert_eq!(recorder.frames.lock().unwrap().len(), 1);

        mux.handle_frame(chunk(&[1, 2, 3])).unwrap();
        assert_eq!(recorder.frames.lock().unwrap().len(), 1);
        mux.handle_frame(chunk(&[4, 5, 6])).unwrap();

        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message().unwrap().get_str("img"), Some("/local/dog.png"));
        assert_eq!(frames[1].request_id, 5);
        assert_eq!(
            frames[1].message().unwrap().get_bytes("img"),
            Some(&[1, 2, 3, 4, 5, 6][..])
        );
    }

    #[test]
    fn test_serve_until_eof() {
        let mut input = vec![];
        write_message(&mut input, SERVICE_HOST, 1, &Message::new(Command::Echo)).unwrap();
        write_message(&mut input, SERVICE_HOST, 2, &Message::new(Command::Echo)).unwrap();
        let writer = FrameWriter::new(vec![]);
        let cache = Arc::new(Mutex::new(ImageCache::new()));
        let mut mux = Multiplexer::new(host_service(cache), writer.clone());
        mux.serve(Cursor::new(input)).unwrap();
        assert_eq!(replies(&writer).len(), 2);
    }
}
