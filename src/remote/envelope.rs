//! Wire format of cross-process task calls.
//!
//! Every message is a length-prefixed frame, all integers big-endian:
//!
//! ```text
//! frame    := len:u32 payload[len]
//! payload  := tag:u8 call_id:u64 body
//! request  := name:str type_id:str is_await:u8 process:str
//!             deps:u32 str* results:u32 (key:str blob)*
//! reply    := 0x00 blob
//!           | 0x01 message:str frames:u32 (class:str file:str method:str line:i32)*
//! str      := len:u32 utf8[len]
//! blob     := 0x00 | 0x01 len:u32 bytes[len]
//! ```
//!
//! A blob starting with `0x00` is the null marker, the task ran and returned
//! nothing.

use std::fmt::Display;
use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::descriptor::{ExecutorKind, TaskDescriptor, TaskId};
use crate::error::CodecError;
use crate::store::Results;
use crate::value::Value;

/// Upper bound on the payload of a single frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const TAG_REQUEST: u8 = 0x01;
const TAG_REPLY: u8 = 0x02;

const REPLY_COMPLETED: u8 = 0x00;
const REPLY_EXCEPTION: u8 = 0x01;

const BLOB_NULL: u8 = 0x00;
const BLOB_VALUE: u8 = 0x01;

/// Invocation of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub id: TaskId,
    pub is_await: bool,
    pub process: String,
    pub dependencies: Vec<TaskId>,
    pub results: Vec<(TaskId, Value)>,
}

impl Request {
    pub fn new(task: &TaskDescriptor, results: &Results) -> Self {
        Self {
            name: task.name().to_string(),
            id: task.id().clone(),
            is_await: task.kind() == ExecutorKind::RemoteAwait,
            process: task.process().to_string(),
            dependencies: task.dependencies().iter().cloned().collect(),
            results: results.to_bundle(),
        }
    }

    /// Whether `task` is the task this request describes.
    pub fn matches(&self, task: &TaskDescriptor) -> bool {
        task.id() == &self.id
            && task.kind() == ExecutorKind::remote(self.is_await)
            && task.process() == self.process
            && task.dependencies().iter().eq(self.dependencies.iter())
    }
}

/// Outcome of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Completed(Option<Value>),
    Exception(RemoteException),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Reply(Reply),
}

/// A decoded frame payload. The call id pairs a reply with its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub call_id: u64,
    pub body: Body,
}

/// One frame of the stack trace carried by a [`RemoteException`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub class_name: String,
    pub file_name: String,
    pub method_name: String,
    pub line: i32,
}

/// Failure of a task body in a satellite process, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    message: String,
    frames: Vec<StackFrame>,
}

impl RemoteException {
    pub fn new(message: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        Self {
            message: message.into(),
            frames,
        }
    }

    /// Captures a local failure for shipping to the caller.
    pub fn capture(error: &anyhow::Error) -> Self {
        Self {
            message: format!("remote exception: {error:#}"),
            frames: parse_backtrace(&error.backtrace().to_string()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

impl Display for RemoteException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        for frame in &self.frames {
            write!(
                f,
                "\n    at {}::{} ({}:{})",
                frame.class_name, frame.method_name, frame.file_name, frame.line
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteException {}

/// Turns a rendered `std::backtrace::Backtrace` into stack frames. Renders of
/// a disabled backtrace contain no frames.
fn parse_backtrace(rendered: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();

    for line in rendered.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            let Some(frame) = frames.last_mut() else {
                continue;
            };
            let mut parts = location.rsplitn(3, ':');
            let _column = parts.next();
            let line = parts.next().and_then(|n| n.parse().ok());
            if let (Some(line), Some(file)) = (line, parts.next()) {
                frame.file_name = file.to_string();
                frame.line = line;
            }
        } else if let Some((index, symbol)) = line.split_once(": ")
            && index.chars().all(|c| c.is_ascii_digit())
        {
            let (class_name, method_name) = symbol.rsplit_once("::").unwrap_or(("", symbol));
            frames.push(StackFrame {
                class_name: class_name.to_string(),
                file_name: String::new(),
                method_name: method_name.to_string(),
                line: -1,
            });
        }
    }

    frames
}

impl Envelope {
    pub fn request(call_id: u64, request: Request) -> Self {
        Self {
            call_id,
            body: Body::Request(request),
        }
    }

    pub fn reply(call_id: u64, reply: Reply) -> Self {
        Self {
            call_id,
            body: Body::Reply(reply),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match &self.body {
            Body::Request(request) => {
                buf.put_u8(TAG_REQUEST);
                buf.put_u64(self.call_id);
                put_str(&mut buf, &request.name);
                put_str(&mut buf, request.id.as_str());
                buf.put_u8(request.is_await.into());
                put_str(&mut buf, &request.process);
                buf.put_u32(request.dependencies.len() as u32);
                for id in &request.dependencies {
                    put_str(&mut buf, id.as_str());
                }
                buf.put_u32(request.results.len() as u32);
                for (key, value) in &request.results {
                    put_str(&mut buf, key.as_str());
                    put_blob(&mut buf, Some(value));
                }
            }
            Body::Reply(reply) => {
                buf.put_u8(TAG_REPLY);
                buf.put_u64(self.call_id);
                match reply {
                    Reply::Completed(value) => {
                        buf.put_u8(REPLY_COMPLETED);
                        put_blob(&mut buf, value.as_ref());
                    }
                    Reply::Exception(exception) => {
                        buf.put_u8(REPLY_EXCEPTION);
                        put_str(&mut buf, &exception.message);
                        buf.put_u32(exception.frames.len() as u32);
                        for frame in &exception.frames {
                            put_str(&mut buf, &frame.class_name);
                            put_str(&mut buf, &frame.file_name);
                            put_str(&mut buf, &frame.method_name);
                            buf.put_i32(frame.line);
                        }
                    }
                }
            }
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let tag = get_u8(&mut buf)?;
        let call_id = get_u64(&mut buf)?;

        let body = match tag {
            TAG_REQUEST => {
                let name = get_str(&mut buf)?;
                let id = TaskId::from(get_str(&mut buf)?);
                let is_await = get_u8(&mut buf)? != 0;
                let process = get_str(&mut buf)?;

                let count = get_u32(&mut buf)?;
                let mut dependencies = Vec::new();
                for _ in 0..count {
                    dependencies.push(TaskId::from(get_str(&mut buf)?));
                }

                let count = get_u32(&mut buf)?;
                let mut results = Vec::new();
                for _ in 0..count {
                    let key = TaskId::from(get_str(&mut buf)?);
                    // A null marker in a bundle means the key was never written.
                    if let Some(value) = get_blob(&mut buf)? {
                        results.push((key, value));
                    }
                }

                Body::Request(Request {
                    name,
                    id,
                    is_await,
                    process,
                    dependencies,
                    results,
                })
            }
            TAG_REPLY => match get_u8(&mut buf)? {
                REPLY_COMPLETED => Body::Reply(Reply::Completed(get_blob(&mut buf)?)),
                REPLY_EXCEPTION => {
                    let message = get_str(&mut buf)?;
                    let count = get_u32(&mut buf)?;
                    let mut frames = Vec::new();
                    for _ in 0..count {
                        frames.push(StackFrame {
                            class_name: get_str(&mut buf)?,
                            file_name: get_str(&mut buf)?,
                            method_name: get_str(&mut buf)?,
                            line: get_i32(&mut buf)?,
                        });
                    }
                    Body::Reply(Reply::Exception(RemoteException { message, frames }))
                }
                kind => return Err(CodecError::UnknownTag(kind)),
            },
            tag => return Err(CodecError::UnknownTag(tag)),
        };

        Ok(Self { call_id, body })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, value: Option<&Value>) {
    match value {
        None => buf.put_u8(BLOB_NULL),
        Some(value) => {
            buf.put_u8(BLOB_VALUE);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
    }
}

fn ensure(buf: &Bytes, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_str(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = get_bytes(buf)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn get_blob(buf: &mut Bytes) -> Result<Option<Value>, CodecError> {
    match get_u8(buf)? {
        BLOB_NULL => Ok(None),
        BLOB_VALUE => Ok(Some(Value::from_bytes(get_bytes(buf)?.to_vec()))),
        marker => Err(CodecError::UnknownTag(marker)),
    }
}

/// Reads one frame. Returns `None` when the stream ends cleanly between
/// frames.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Bytes>, CodecError> {
    let mut head = [0u8; 4];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(head) as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => CodecError::Truncated,
        _ => e.into(),
    })?;

    Ok(Some(Bytes::from(payload)))
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<(), CodecError> {
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
