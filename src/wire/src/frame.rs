//! Byte level framing over a duplex stream.
//!
//! Readers never hand out a partial frame: they block for the whole header and then
//! for exactly `length` body bytes.

use crate::{lock, Error, Message, Result};
use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex},
};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 10;
/// Largest body we are willing to allocate for.
pub const MAX_BODY_LEN: usize = 512 * 1024 * 1024;
/// Service id of the host process itself.
pub const SERVICE_HOST: u16 = 0;
/// Service id of the inference process behind a host.
pub const SERVICE_INFERENCE: u16 = 1;
/// Ids from here on are never assigned by us; seeing one is a desync symptom.
pub const FIRST_UNRESERVED_SERVICE: u16 = 256;

/// One frame. `request_id == 0` marks a message that expects no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Destination service.
    pub service_id: u16,
    /// Correlates a reply with its request.
    pub request_id: u32,
    /// Encoded message.
    pub body: Vec<u8>,
}

impl Frame {
    /// Encodes `message` into a frame.
    pub fn new(service_id: u16, request_id: u32, message: &Message) -> Result<Self> {
        let body = message.encode()?;
        if body.len() > MAX_BODY_LEN {
            return Err(Error::TooLarge(body.len()));
        }
        Ok(Frame {
            service_id,
            request_id,
            body,
        })
    }

    /// Decodes the body.
    pub fn message(&self) -> Result<Message> {
        Message::decode(&self.body)
    }

    /// The 10 byte header of this frame.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&self.service_id.to_be_bytes());
        header[2..6].copy_from_slice(&(self.body.len() as u32).to_be_bytes());
        header[6..10].copy_from_slice(&self.request_id.to_be_bytes());
        header
    }

    /// Header and body as they go on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.body.len());
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Writes and flushes the frame.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.header())?;
        writer.write_all(&self.body)?;
        writer.flush()?;
        Ok(())
    }
}

/// Encodes and writes one message, then flushes.
pub fn write_message<W: Write + ?Sized>(
    writer: &mut W,
    service_id: u16,
    request_id: u32,
    message: &Message,
) -> Result<()> {
    Frame::new(service_id, request_id, message)?.write_to(writer)
}

/// Reads one frame. `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let service_id = u16::from_be_bytes([header[0], header[1]]);
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let request_id = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);
    if length > MAX_BODY_LEN {
        return Err(Error::TooLarge(length));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Truncated,
        _ => Error::Io(e),
    })?;
    Ok(Some(Frame {
        service_id,
        request_id,
        body,
    }))
}

/// Reads and decodes one frame into `(service_id, request_id, message)`.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Option<(u16, u32, Message)>> {
    match read_frame(reader)? {
        Some(frame) => {
            let message = frame.message()?;
            Ok(Some((frame.service_id, frame.request_id, message)))
        }
        None => Ok(None),
    }
}

/// Cloneable writer end shared by every thread that answers on the same stream.
pub struct FrameWriter<W> {
    pub(crate) inner: Arc<Mutex<W>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        FrameWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write> FrameWriter<W> {
    /// Wraps a stream.
    pub fn new(writer: W) -> Self {
        FrameWriter {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes a frame as one unit.
    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = lock(&self.inner);
        frame.write_to(&mut *writer)
    }

    /// Encodes and writes a message as one unit.
    pub fn write_message(&self, service_id: u16, request_id: u32, message: &Message) -> Result<()> {
        let frame = Frame::new(service_id, request_id, message)?;
        self.write_frame(&frame)
    }
}
