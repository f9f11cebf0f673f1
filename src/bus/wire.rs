//! Frame codec.
//!
//! One frame per datagram, little-endian throughout:
//!
//! ```text
//! frame := kind:u8 serial:u32
//!          CALL  -> method:str16 body
//!          REPLY -> body
//!          ERROR -> code:u8 message:str16
//! body  := signature:str16 nwords:u16 words[nwords]:u32
//! str16 := len:u16 utf8-bytes
//! ```
//!
//! Attached descriptors ride in the ancillary data of the same datagram
//! and are indexed by `h`-typed words in the body.

use crate::error::{Error, Result};

/// Upper bound on an encoded frame; method names, signatures, and error
/// strings are all short.
pub const MAX_FRAME_LEN: usize = 1024;

/// Error categories a method call can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad signature, missing descriptor, unsealed or unreadable fd.
    InvalidArgs,
    /// Internal daemon failure (descriptor-list manipulation).
    Failed,
    /// No such method on the interface.
    UnknownMethod,
}

impl ErrorCode {
    fn to_u8(self) -> u8 {
        match self {
            ErrorCode::InvalidArgs => 1,
            ErrorCode::Failed => 2,
            ErrorCode::UnknownMethod => 3,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ErrorCode::InvalidArgs),
            2 => Some(ErrorCode::Failed),
            3 => Some(ErrorCode::UnknownMethod),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgs => "invalid-args",
            ErrorCode::Failed => "failed",
            ErrorCode::UnknownMethod => "unknown-method",
        };
        f.write_str(s)
    }
}

/// A typed argument payload: a signature string plus packed 32-bit words.
///
/// The dispatcher validates the signature before interpreting the words,
/// so ill-typed payloads are representable on the wire and rejected at the
/// method boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    /// Type signature, e.g. `(h)`, `(u)`, `(ahu)`, `()`.
    pub signature: String,
    /// Argument words in signature order; arrays are length-prefixed.
    pub words: Vec<u32>,
}

impl Body {
    /// The empty tuple `()`.
    pub fn unit() -> Self {
        Self {
            signature: "()".into(),
            words: Vec::new(),
        }
    }

    /// A `(h)` payload: one index into the attached descriptor list.
    pub fn fd_index(index: u32) -> Self {
        Self {
            signature: "(h)".into(),
            words: vec![index],
        }
    }

    /// A `(u)` payload: one handle.
    pub fn handle(handle: u32) -> Self {
        Self {
            signature: "(u)".into(),
            words: vec![handle],
        }
    }

    /// A `(ahu)` payload: descriptor indexes plus a handle.
    pub fn fds_and_handle(indexes: &[u32], handle: u32) -> Self {
        let mut words = Vec::with_capacity(indexes.len() + 2);
        words.push(indexes.len() as u32);
        words.extend_from_slice(indexes);
        words.push(handle);
        Self {
            signature: "(ahu)".into(),
            words,
        }
    }

    /// Interpret as `(h)`.
    pub fn as_fd_index(&self) -> Option<u32> {
        if self.signature == "(h)" && self.words.len() == 1 {
            Some(self.words[0])
        } else {
            None
        }
    }

    /// Interpret as `(u)`.
    pub fn as_handle(&self) -> Option<u32> {
        if self.signature == "(u)" && self.words.len() == 1 {
            Some(self.words[0])
        } else {
            None
        }
    }

    /// Interpret as `(ahu)`, yielding `(descriptor indexes, handle)`.
    pub fn as_fds_and_handle(&self) -> Option<(&[u32], u32)> {
        if self.signature != "(ahu)" || self.words.len() < 2 {
            return None;
        }
        let count = self.words[0] as usize;
        if self.words.len() != count + 2 {
            return None;
        }
        Some((&self.words[1..1 + count], self.words[1 + count]))
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Method invocation.
    Call {
        /// Caller-chosen serial echoed in the reply.
        serial: u32,
        /// Method name on the well-known interface.
        method: String,
        /// Arguments.
        body: Body,
    },
    /// Successful reply to `serial`.
    Reply {
        /// Serial of the call being answered.
        serial: u32,
        /// Result payload.
        body: Body,
    },
    /// Error reply to `serial`.
    Error {
        /// Serial of the call being answered.
        serial: u32,
        /// Error category.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

const KIND_CALL: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_ERROR: u8 = 3;

impl Frame {
    /// Serial this frame belongs to.
    pub fn serial(&self) -> u32 {
        match self {
            Frame::Call { serial, .. } | Frame::Reply { serial, .. } | Frame::Error { serial, .. } => {
                *serial
            }
        }
    }

    /// Encode into a datagram payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Frame::Call {
                serial,
                method,
                body,
            } => {
                buf.push(KIND_CALL);
                buf.extend_from_slice(&serial.to_le_bytes());
                put_str(&mut buf, method);
                put_body(&mut buf, body);
            }
            Frame::Reply { serial, body } => {
                buf.push(KIND_REPLY);
                buf.extend_from_slice(&serial.to_le_bytes());
                put_body(&mut buf, body);
            }
            Frame::Error {
                serial,
                code,
                message,
            } => {
                buf.push(KIND_ERROR);
                buf.extend_from_slice(&serial.to_le_bytes());
                buf.push(code.to_u8());
                put_str(&mut buf, message);
            }
        }
        buf
    }

    /// Decode a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] on truncated or inconsistent input.
    pub fn decode(data: &[u8]) -> Result<Frame> {
        let mut r = Reader { data, pos: 0 };
        let kind = r.u8()?;
        let serial = r.u32()?;

        let frame = match kind {
            KIND_CALL => Frame::Call {
                serial,
                method: r.str16()?,
                body: r.body()?,
            },
            KIND_REPLY => Frame::Reply {
                serial,
                body: r.body()?,
            },
            KIND_ERROR => {
                let code = ErrorCode::from_u8(r.u8()?)
                    .ok_or_else(|| Error::Malformed("unknown error code".into()))?;
                Frame::Error {
                    serial,
                    code,
                    message: r.str16()?,
                }
            }
            other => return Err(Error::Malformed(format!("unknown frame kind {other}"))),
        };

        if r.pos != data.len() {
            return Err(Error::Malformed("trailing bytes after frame".into()));
        }
        Ok(frame)
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_body(buf: &mut Vec<u8>, body: &Body) {
    put_str(buf, &body.signature);
    buf.extend_from_slice(&(body.words.len() as u16).to_le_bytes());
    for word in &body.words {
        buf.extend_from_slice(&word.to_le_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::Malformed("truncated frame".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str16(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Malformed("non-utf8 string in frame".into()))
    }

    fn body(&mut self) -> Result<Body> {
        let signature = self.str16()?;
        let nwords = self.u16()? as usize;
        let mut words = Vec::with_capacity(nwords);
        for _ in 0..nwords {
            words.push(self.u32()?);
        }
        Ok(Body { signature, words })
    }
}
