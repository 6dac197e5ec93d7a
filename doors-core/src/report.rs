//! Uplink body of a sync session: requested gaps + buffered action results.

use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::package::Seq;
use crate::tracker::Results;

/// Inclusive run of missing sequence numbers. Encoded as `[n]` or `[lo,hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: Seq,
    pub end: Seq,
}

impl Gap {
    pub fn new(start: Seq, end: Seq) -> Self {
        Self { start, end }
    }

    pub fn single(seq: Seq) -> Self {
        Self {
            start: seq,
            end: seq,
        }
    }
}

impl Serialize for Gap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.start == self.end {
            let mut seq = serializer.serialize_seq(Some(1))?;
            seq.serialize_element(&self.start)?;
            return seq.end();
        }
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.start)?;
        seq.serialize_element(&self.end)?;
        seq.end()
    }
}

/// Snapshot carried by one session open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Upload {
    pub gaps: Vec<Gap>,
    pub results: Results,
}

impl Upload {
    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty() && self.results.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

struct ResultsMap<'a>(&'a Results);

impl Serialize for ResultsMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (seq, outcome) in self.0 {
            match outcome {
                Ok(value) => map.serialize_entry(seq, &(value, None::<&str>))?,
                Err(message) => map.serialize_entry(seq, &(None::<&str>, message))?,
            }
        }
        map.end()
    }
}

impl Serialize for Upload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Upload", 2)?;
        s.serialize_field("gaps", &self.gaps)?;
        s.serialize_field("results", &ResultsMap(&self.results))?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upload_json_shape() {
        let mut upload = Upload {
            gaps: vec![Gap::new(2, 3), Gap::single(6)],
            ..Upload::default()
        };
        upload.results.insert(1, Ok(json!({"x": 1})));
        upload.results.insert(4, Err("Handler foo not found".into()));
        let v: serde_json::Value = serde_json::from_slice(&upload.to_json().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "gaps": [[2, 3], [6]],
                "results": {
                    "1": [{"x": 1}, null],
                    "4": [null, "Handler foo not found"],
                }
            })
        );
    }
}
