//! Downlink framing: signal byte, JSON header, optional length-delimited payload.
//!
//! ```text
//! 0x01 <header json> 0xFF [<payload: length bytes> 0xFF]
//! ```
//! Header: `[[end] | [end,start], [action,arg] | null, [payloadType,length]?]`.
//! `0xFD` in place of a terminator abandons the frame.

use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::{debug, trace};

use crate::package::{Call, Package, Payload, Seq};

pub const SIGNAL_ACK: u8 = 0x00;
pub const SIGNAL_HEADER: u8 = 0x01;
pub const SIGNAL_ROLL: u8 = 0x02;
pub const SIGNAL_SUSPEND: u8 = 0x03;
pub const SIGNAL_KILL: u8 = 0x04;

pub const TERMINATOR: u8 = 0xFF;
pub const DISCARD: u8 = 0xFD;

const MAX_HEADER_LEN: usize = 64 * 1024; // 64 KiB
const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024; // 16 MiB

/// Declared payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Binary,
    Json,
    Text,
    GzipBinary,
    GzipJson,
    GzipText,
}

impl PayloadType {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::Binary,
            1 => Self::Json,
            2 => Self::Text,
            3 => Self::GzipBinary,
            4 => Self::GzipJson,
            5 => Self::GzipText,
            _ => return None,
        })
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Binary => 0,
            Self::Json => 1,
            Self::Text => 2,
            Self::GzipBinary => 3,
            Self::GzipJson => 4,
            Self::GzipText => 5,
        }
    }

    fn is_gzip(self) -> bool {
        matches!(self, Self::GzipBinary | Self::GzipJson | Self::GzipText)
    }
}

/// What the parser saw in a chunk, in stream order.
#[derive(Debug)]
pub enum WireEvent {
    Ack,
    Package(Package),
    /// A frame was dropped; the parser has resynchronised.
    Malformed(FormatError),
    Roll,
    Suspend,
    Kill,
}

/// Frame-level format error. Never fatal for the stream.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("unknown signal byte {0:#04x}")]
    UnknownSignal(u8),
    #[error("header exceeds {MAX_HEADER_LEN} bytes")]
    HeaderTooLarge,
    #[error("header is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed header: {0}")]
    Header(&'static str),
    #[error("call frame must cover one sequence number, got {start}..={end}")]
    CallRange { start: Seq, end: Seq },
    #[error("unknown payload type {0}")]
    PayloadType(u64),
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(u64),
    #[error("payload not followed by terminator (got {0:#04x})")]
    MissingTerminator(u8),
    #[error("payload decode failed: {0}")]
    Payload(String),
}

#[derive(Debug)]
struct Header {
    start: Seq,
    end: Seq,
    call: Option<Call>,
    payload: Option<(PayloadType, u64)>,
}

enum State {
    Signal,
    Header(Vec<u8>),
    Payload {
        header: Header,
        buf: Vec<u8>,
        len: usize,
    },
    Trailer {
        header: Header,
        buf: Vec<u8>,
    },
    /// Dropping the rest of an oversized frame up to its terminator.
    Skip,
    /// Dropping a declared payload that exceeds the limit.
    Drain { remaining: u64 },
    /// Byte after a drained payload: terminator or discard is consumed,
    /// anything else is read as a signal.
    DrainEnd,
    Done,
}

/// Incremental downlink parser. Chunks may split frames at any byte.
pub struct WireParser {
    state: State,
}

impl WireParser {
    pub fn new() -> Self {
        Self {
            state: State::Signal,
        }
    }

    /// Consume one chunk, appending events to `out`. Returns true once the
    /// stream is finished (roll, suspend or kill); later bytes are ignored.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<WireEvent>) -> bool {
        let mut rest = data;
        while !rest.is_empty() && !self.is_done() {
            rest = self.step(rest, out);
        }
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn step<'a>(&mut self, data: &'a [u8], out: &mut Vec<WireEvent>) -> &'a [u8] {
        match &mut self.state {
            State::Done => &[],
            State::Signal => {
                match data[0] {
                    SIGNAL_ACK => out.push(WireEvent::Ack),
                    SIGNAL_HEADER => self.state = State::Header(Vec::new()),
                    SIGNAL_ROLL => {
                        out.push(WireEvent::Roll);
                        self.state = State::Done;
                    }
                    SIGNAL_SUSPEND => {
                        out.push(WireEvent::Suspend);
                        self.state = State::Done;
                    }
                    SIGNAL_KILL => {
                        out.push(WireEvent::Kill);
                        self.state = State::Done;
                    }
                    other => out.push(WireEvent::Malformed(FormatError::UnknownSignal(other))),
                }
                &data[1..]
            }
            State::Header(buf) => {
                let Some(i) = data.iter().position(|b| *b == TERMINATOR || *b == DISCARD) else {
                    if buf.len() + data.len() > MAX_HEADER_LEN {
                        out.push(WireEvent::Malformed(FormatError::HeaderTooLarge));
                        self.state = State::Skip;
                    } else {
                        buf.extend_from_slice(data);
                    }
                    return &[];
                };
                if buf.len() + i > MAX_HEADER_LEN {
                    out.push(WireEvent::Malformed(FormatError::HeaderTooLarge));
                    self.state = State::Signal;
                    return &data[i + 1..];
                }
                buf.extend_from_slice(&data[..i]);
                let header = std::mem::take(buf);
                self.state = State::Signal;
                if data[i] == DISCARD {
                    debug!("frame discarded in header");
                } else {
                    self.on_header(&header, out);
                }
                &data[i + 1..]
            }
            State::Payload { buf, len, .. } => {
                let take = (*len - buf.len()).min(data.len());
                buf.extend_from_slice(&data[..take]);
                if buf.len() == *len {
                    if let State::Payload { header, buf, .. } =
                        std::mem::replace(&mut self.state, State::Signal)
                    {
                        self.state = State::Trailer { header, buf };
                    }
                }
                &data[take..]
            }
            State::Trailer { .. } => {
                let State::Trailer { header, buf } =
                    std::mem::replace(&mut self.state, State::Signal)
                else {
                    return data;
                };
                match data[0] {
                    TERMINATOR => out.push(finish(header, buf)),
                    DISCARD => debug!(end = header.end, "frame discarded in payload"),
                    other => {
                        // Re-read the byte as a signal.
                        out.push(WireEvent::Malformed(FormatError::MissingTerminator(other)));
                        return data;
                    }
                }
                &data[1..]
            }
            State::Drain { remaining } => {
                let take = (*remaining).min(data.len() as u64);
                *remaining -= take;
                if *remaining == 0 {
                    self.state = State::DrainEnd;
                }
                &data[take as usize..]
            }
            State::DrainEnd => {
                self.state = State::Signal;
                match data[0] {
                    TERMINATOR | DISCARD => &data[1..],
                    _ => data,
                }
            }
            State::Skip => match data.iter().position(|b| *b == TERMINATOR || *b == DISCARD) {
                Some(i) => {
                    self.state = State::Signal;
                    &data[i + 1..]
                }
                None => &[],
            },
        }
    }

    fn on_header(&mut self, bytes: &[u8], out: &mut Vec<WireEvent>) {
        let header = match parse_header(bytes) {
            Ok(h) => h,
            Err(e) => {
                out.push(WireEvent::Malformed(e));
                return;
            }
        };
        match header.payload {
            Some((_, len)) if len > MAX_PAYLOAD_LEN => {
                out.push(WireEvent::Malformed(FormatError::PayloadTooLarge(len)));
                self.state = State::Drain { remaining: len };
            }
            Some((_, len)) if len > 0 => {
                trace!(end = header.end, len, "awaiting payload");
                let len = len as usize;
                self.state = State::Payload {
                    header,
                    buf: Vec::with_capacity(len.min(MAX_HEADER_LEN)),
                    len,
                };
            }
            _ => out.push(WireEvent::Package(Package {
                start: header.start,
                end: header.end,
                call: header.call,
                payload: Payload::None,
            })),
        }
    }
}

impl Default for WireParser {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(header: Header, buf: Vec<u8>) -> WireEvent {
    let Some((ty, _)) = header.payload else {
        return WireEvent::Malformed(FormatError::Header("payload without descriptor"));
    };
    match decode_payload(ty, buf) {
        Ok(payload) => WireEvent::Package(Package {
            start: header.start,
            end: header.end,
            call: header.call,
            payload,
        }),
        Err(e) => WireEvent::Malformed(e),
    }
}

fn parse_header(bytes: &[u8]) -> Result<Header, FormatError> {
    let parts: Vec<Value> = serde_json::from_slice(bytes)?;
    let mut parts = parts.into_iter();
    let range: Vec<Seq> = match parts.next() {
        Some(v) => serde_json::from_value(v)?,
        None => return Err(FormatError::Header("empty header")),
    };
    let (start, end) = match range.as_slice() {
        [end] => (*end, *end),
        [end, start] => (*start, *end),
        _ => return Err(FormatError::Header("range must have one or two elements")),
    };
    if start == 0 || start > end {
        return Err(FormatError::Header("invalid range"));
    }
    if end == Seq::MAX {
        return Err(FormatError::Header("sequence number out of range"));
    }
    let call: Option<Call> = match parts.next() {
        None | Some(Value::Null) => None,
        Some(v) => Some(serde_json::from_value(v)?),
    };
    if call.is_some() && start != end {
        return Err(FormatError::CallRange { start, end });
    }
    let payload = match parts.next() {
        None | Some(Value::Null) => None,
        Some(v) => {
            let (code, len): (u64, u64) = serde_json::from_value(v)?;
            let ty = PayloadType::from_code(code).ok_or(FormatError::PayloadType(code))?;
            Some((ty, len))
        }
    };
    Ok(Header {
        start,
        end,
        call,
        payload,
    })
}

fn decode_payload(ty: PayloadType, buf: Vec<u8>) -> Result<Payload, FormatError> {
    let raw = if ty.is_gzip() {
        let mut out = Vec::new();
        GzDecoder::new(buf.as_slice())
            .take(MAX_PAYLOAD_LEN + 1)
            .read_to_end(&mut out)
            .map_err(|e| FormatError::Payload(e.to_string()))?;
        if out.len() as u64 > MAX_PAYLOAD_LEN {
            return Err(FormatError::PayloadTooLarge(out.len() as u64));
        }
        out
    } else {
        buf
    };
    match ty {
        PayloadType::Binary | PayloadType::GzipBinary => Ok(Payload::Binary(raw)),
        PayloadType::Json | PayloadType::GzipJson => serde_json::from_slice(&raw)
            .map(Payload::Json)
            .map_err(|e| FormatError::Payload(e.to_string())),
        PayloadType::Text | PayloadType::GzipText => String::from_utf8(raw)
            .map(Payload::Text)
            .map_err(|e| FormatError::Payload(e.to_string())),
    }
}

/// Encode a package as one frame (uncompressed payload).
pub fn encode_frame(package: &Package) -> Result<Vec<u8>, FormatError> {
    let range = if package.start == package.end {
        vec![package.end]
    } else {
        vec![package.end, package.start]
    };
    let mut header = vec![serde_json::to_value(range)?];
    let body = match &package.payload {
        Payload::None => None,
        Payload::Binary(b) => Some((PayloadType::Binary, b.clone())),
        Payload::Json(v) => Some((PayloadType::Json, serde_json::to_vec(v)?)),
        Payload::Text(s) => Some((PayloadType::Text, s.as_bytes().to_vec())),
    };
    let body = body.filter(|(_, b)| !b.is_empty());
    match (&package.call, &body) {
        (Some(call), _) => header.push(Value::Array(vec![
            Value::String(call.action.clone()),
            call.arg.clone(),
        ])),
        (None, Some(_)) => header.push(Value::Null),
        (None, None) => {}
    }
    if let Some((ty, b)) = &body {
        header.push(serde_json::json!([ty.code(), b.len()]));
    }
    let mut out = vec![SIGNAL_HEADER];
    out.extend_from_slice(&serde_json::to_vec(&header)?);
    out.push(TERMINATOR);
    if let Some((_, b)) = body {
        out.extend_from_slice(&b);
        out.push(TERMINATOR);
    }
    Ok(out)
}
