//! OSC 1.0 message codec for datagram transports.
//!
//! Each UDP datagram carries exactly one OSC message. Only the argument types
//! the NSM vocabulary uses are supported.
//!
//! Message layout:
//! ```text
//! +-------------------+----------------------+------------------+
//! |  address (str)    |  type tags (",sif")  |  arguments       |
//! |  NUL padded to 4  |  NUL padded to 4     |  big-endian      |
//! +-------------------+----------------------+------------------+
//! ```

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload a single UDP datagram can carry over IPv4.
const MAX_PACKET_SIZE: usize = 65_507;

/// Address prefix used by OSC bundles.
const BUNDLE_TAG: &str = "#bundle";

/// A single typed OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Str(String),
    Int(i32),
    Float(f32),
}

impl OscArg {
    const fn type_tag(&self) -> u8 {
        match self {
            Self::Str(_) => b's',
            Self::Int(_) => b'i',
            Self::Float(_) => b'f',
        }
    }
}

impl From<&str> for OscArg {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for OscArg {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i32> for OscArg {
    fn from(n: i32) -> Self {
        Self::Int(n)
    }
}

impl From<f32> for OscArg {
    fn from(x: f32) -> Self {
        Self::Float(x)
    }
}

impl fmt::Display for OscArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

/// An OSC message: an address path plus an ordered argument list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<OscArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn string_arg(&self, index: usize) -> Option<&str> {
        match self.args.get(index) {
            Some(OscArg::Str(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn int_arg(&self, index: usize) -> Option<i32> {
        match self.args.get(index) {
            Some(OscArg::Int(n)) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn float_arg(&self, index: usize) -> Option<f32> {
        match self.args.get(index) {
            Some(OscArg::Float(x)) => Some(*x),
            _ => None,
        }
    }

    /// The `,sif`-style type tag string for this message.
    #[must_use]
    pub fn type_tags(&self) -> String {
        std::iter::once(',')
            .chain(self.args.iter().map(|arg| char::from(arg.type_tag())))
            .collect()
    }
}

impl fmt::Display for OscMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Codec turning datagrams into [`OscMessage`]s and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct OscCodec;

impl OscCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for OscCodec {
    type Item = OscMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // The whole datagram is consumed up front so a malformed packet never
        // lingers in the read buffer.
        let mut packet = src.split().freeze();

        if packet.len() > MAX_PACKET_SIZE {
            return Err(CodecError::MessageTooLarge(packet.len()));
        }

        let address = read_padded_str(&mut packet)?;
        if address == BUNDLE_TAG {
            return Err(CodecError::BundleUnsupported);
        }
        if !address.starts_with('/') {
            return Err(CodecError::InvalidAddress(address));
        }

        if !packet.has_remaining() {
            return Ok(Some(OscMessage::new(address)));
        }

        let tags = read_padded_str(&mut packet)?;
        let Some(tags) = tags.strip_prefix(',') else {
            return Err(CodecError::MissingTypeTags);
        };

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                's' => OscArg::Str(read_padded_str(&mut packet)?),
                'i' => {
                    ensure_remaining(&packet, 4)?;
                    OscArg::Int(packet.get_i32())
                }
                'f' => {
                    ensure_remaining(&packet, 4)?;
                    OscArg::Float(packet.get_f32())
                }
                other => return Err(CodecError::UnsupportedTypeTag(other)),
            };
            args.push(arg);
        }

        Ok(Some(OscMessage { address, args }))
    }
}

impl Encoder<OscMessage> for OscCodec {
    type Error = CodecError;

    fn encode(&mut self, item: OscMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut packet = BytesMut::new();

        put_padded_str(&mut packet, &item.address)?;
        put_padded_str(&mut packet, &item.type_tags())?;
        for arg in &item.args {
            match arg {
                OscArg::Str(s) => put_padded_str(&mut packet, s)?,
                OscArg::Int(n) => packet.put_i32(*n),
                OscArg::Float(x) => packet.put_f32(*x),
            }
        }

        if packet.len() > MAX_PACKET_SIZE {
            return Err(CodecError::MessageTooLarge(packet.len()));
        }

        dst.reserve(packet.len());
        dst.put(packet);
        Ok(())
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated);
    }
    Ok(())
}

fn read_padded_str(buf: &mut Bytes) -> Result<String, CodecError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::Truncated)?;
    let padded = (nul / 4 + 1) * 4;
    ensure_remaining(buf, padded)?;

    let raw = buf.split_to(padded);
    let text = std::str::from_utf8(&raw[..nul])?;
    Ok(text.to_string())
}

fn put_padded_str(dst: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    if s.contains('\0') {
        return Err(CodecError::EmbeddedNul);
    }
    dst.put_slice(s.as_bytes());
    dst.put_bytes(0, 4 - s.len() % 4);
    Ok(())
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Message too large: {0} bytes (max: {MAX_PACKET_SIZE})")]
    MessageTooLarge(usize),

    #[error("Truncated OSC packet")]
    Truncated,

    #[error("Invalid OSC address: {0:?}")]
    InvalidAddress(String),

    #[error("Missing OSC type tag string")]
    MissingTypeTags,

    #[error("Unsupported OSC type tag: {0:?}")]
    UnsupportedTypeTag(char),

    #[error("OSC bundles are not supported")]
    BundleUnsupported,

    #[error("OSC strings cannot contain NUL bytes")]
    EmbeddedNul,
}
