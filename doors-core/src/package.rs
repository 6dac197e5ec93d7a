//! Packages: reassembled units of the downlink stream.

use serde::Deserialize;
use serde_json::Value;

/// Downlink sequence number. The first package of an instance is 1.
pub type Seq = u64;

/// Action name + argument, executed locally once its package is delivered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "(String, Value)")]
pub struct Call {
    pub action: String,
    pub arg: Value,
}

impl Call {
    pub fn new(action: impl Into<String>, arg: Value) -> Self {
        Self {
            action: action.into(),
            arg,
        }
    }
}

impl From<(String, Value)> for Call {
    fn from((action, arg): (String, Value)) -> Self {
        Self { action, arg }
    }
}

/// Decoded payload body attached to a call.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Binary(Vec<u8>),
    Json(Value),
    Text(String),
}

/// One package covering the inclusive range `start..=end`.
/// Filler packages (no call) only mark their range as delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub start: Seq,
    pub end: Seq,
    pub call: Option<Call>,
    pub payload: Payload,
}

impl Package {
    pub fn filler(start: Seq, end: Seq) -> Self {
        Self {
            start,
            end,
            call: None,
            payload: Payload::None,
        }
    }

    pub fn call(seq: Seq, action: impl Into<String>, arg: Value) -> Self {
        Self {
            start: seq,
            end: seq,
            call: Some(Call::new(action, arg)),
            payload: Payload::None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_filler(&self) -> bool {
        self.call.is_none()
    }

    /// Piece of this package restricted to `start..=end`. The call stays with
    /// the piece that still contains `self.end`; every other piece is filler.
    pub(crate) fn trimmed(&self, start: Seq, end: Seq) -> Package {
        if end == self.end {
            let mut piece = self.clone();
            piece.start = start;
            return piece;
        }
        Package::filler(start, end)
    }
}
