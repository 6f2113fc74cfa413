//! Inbound fragments and outbound responses.
//!
//! # Wire format
//!
//! ```text
//! Fragment: 0x01 <varint id_len><id> <flags:u8> <varint chunk_len><chunk> <zigzag layer>
//! Response: 0x02 <varint id_len><id> <varint results_len><results> <flags:u8>
//!           <varint pair_count> { <varint key_len><key> <zigzag value> }*
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::action::{Action, ActionSet};
use super::varint::{read_varint, write_varint, zigzag_decode, zigzag_encode};
use crate::error::{OffloadError, Result};

/// Message tag for fragments.
pub const FRAGMENT_TAG: u8 = 0x01;
/// Message tag for responses.
pub const RESPONSE_TAG: u8 = 0x02;

/// Keypair attached to timeout responses.
pub const ERROR_KEY: &str = "error";
/// Error code for a session evicted after idling.
pub const TIMEOUT_CODE: i32 = 4;

/// One inbound piece of a session's payload plus its directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Session key
    pub id: String,
    /// Directives for this fragment
    pub action: ActionSet,
    /// Raw payload bytes (may be empty)
    pub chunk: Bytes,
    /// Split-layer index the forward pass resumes at
    pub layer: i32,
}

impl Fragment {
    /// Fragment with no flags and no payload.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: ActionSet::empty(),
            chunk: Bytes::new(),
            layer: 0,
        }
    }

    /// Set the payload chunk.
    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunk = chunk.into();
        self
    }

    /// Add an action flag.
    pub fn with_action(mut self, action: Action) -> Self {
        self.action.insert(action);
        self
    }

    /// Set the split layer.
    pub fn with_layer(mut self, layer: i32) -> Self {
        self.layer = layer;
        self
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.id.len() + self.chunk.len() + 16);
        buf.push(FRAGMENT_TAG);
        write_bytes(&mut buf, self.id.as_bytes());
        buf.push(self.action.bits());
        write_bytes(&mut buf, &self.chunk);
        write_varint(&mut buf, zigzag_encode(self.layer));
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.expect_tag(FRAGMENT_TAG)?;
        let id = reader.string()?;
        let action = ActionSet::from_bits(reader.byte()?)?;
        let chunk = Bytes::copy_from_slice(reader.bytes()?);
        let layer = zigzag_decode(reader.varint()?)?;
        reader.finish()?;
        Ok(Self {
            id,
            action,
            chunk,
            layer,
        })
    }
}

/// Outbound message for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Session key the response belongs to
    pub id: String,
    /// Encoded prediction or error report
    #[serde(with = "results_serde")]
    pub results: Bytes,
    /// Echoed action flags
    pub actions: ActionSet,
    /// Auxiliary metadata (ordered for deterministic encoding)
    pub keypairs: BTreeMap<String, i32>,
}

impl Response {
    /// Response for `id` echoing `actions`.
    pub fn new(id: impl Into<String>, actions: ActionSet) -> Self {
        Self {
            id: id.into(),
            results: Bytes::new(),
            actions,
            keypairs: BTreeMap::new(),
        }
    }

    /// Set the result bytes.
    pub fn with_results(mut self, results: impl Into<Bytes>) -> Self {
        self.results = results.into();
        self
    }

    /// Add a keypair.
    pub fn with_keypair(mut self, key: impl Into<String>, value: i32) -> Self {
        self.keypairs.insert(key.into(), value);
        self
    }

    /// Error report for a per-fragment failure.
    pub fn error(id: impl Into<String>, actions: ActionSet, err: &OffloadError) -> Self {
        let code = err.report_code().unwrap_or(0);
        Self::error_report(id, actions, err.kind(), &err.to_string(), code)
    }

    /// Notification that a session was evicted for idling.
    pub fn timeout(id: impl Into<String>) -> Self {
        Self::error_report(
            id,
            ActionSet::from(Action::End),
            "session_timeout",
            "session evicted after idle timeout",
            TIMEOUT_CODE,
        )
    }

    fn error_report(
        id: impl Into<String>,
        actions: ActionSet,
        kind: &str,
        message: &str,
        code: i32,
    ) -> Self {
        let body = serde_json::json!({
            "error": { "kind": kind, "message": message }
        });
        Self::new(id, actions)
            .with_results(body.to_string())
            .with_keypair(ERROR_KEY, code)
    }

    /// Whether this response reports an error.
    pub fn is_error(&self) -> bool {
        self.keypairs.contains_key(ERROR_KEY)
    }

    /// Parse `results` as JSON.
    pub fn results_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.results)?)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.id.len() + self.results.len() + 32);
        buf.push(RESPONSE_TAG);
        write_bytes(&mut buf, self.id.as_bytes());
        write_bytes(&mut buf, &self.results);
        buf.push(self.actions.bits());
        write_varint(&mut buf, self.keypairs.len() as u64);
        for (key, value) in &self.keypairs {
            write_bytes(&mut buf, key.as_bytes());
            write_varint(&mut buf, zigzag_encode(*value));
        }
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.expect_tag(RESPONSE_TAG)?;
        let id = reader.string()?;
        let results = Bytes::copy_from_slice(reader.bytes()?);
        let actions = ActionSet::from_bits(reader.byte()?)?;
        let count = reader.varint()?;
        let mut keypairs = BTreeMap::new();
        for _ in 0..count {
            let key = reader.string()?;
            let value = zigzag_decode(reader.varint()?)?;
            keypairs.insert(key, value);
        }
        reader.finish()?;
        Ok(Self {
            id,
            results,
            actions,
            keypairs,
        })
    }
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Cursor over a message body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn expect_tag(&mut self, tag: u8) -> Result<()> {
        let found = self.byte()?;
        if found != tag {
            return Err(OffloadError::InvalidMessage(format!(
                "Expected message tag {tag:#04x}, found {found:#04x}"
            )));
        }
        Ok(())
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| OffloadError::InvalidMessage("Unexpected end of message".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, used) = read_varint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.varint()?)
            .map_err(|_| OffloadError::InvalidMessage("Length overflow".to_string()))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                OffloadError::InvalidMessage(format!(
                    "Declared length {len} exceeds remaining {} bytes",
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| OffloadError::InvalidMessage(format!("Invalid UTF-8 in string field: {e}")))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(OffloadError::InvalidMessage(format!(
                "{} trailing bytes after message",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// `results` serialises as a UTF-8 string when possible, else a byte array.
mod results_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(value) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(value.iter()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Bytes::from(text),
            Repr::Raw(raw) => Bytes::from(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_wire_roundtrip() {
        let fragment = Fragment::new("s1")
            .with_chunk(&b"abcd"[..])
            .with_action(Action::Append)
            .with_action(Action::Compressed)
            .with_layer(-3);
        let decoded = Fragment::decode(&fragment.encode()).unwrap();
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn test_response_wire_layout() {
        let response = Response::new("s1", ActionSet::from(Action::Inference))
            .with_results("ok")
            .with_keypair("start_layer", 3);
        let wire = response.encode();
        assert_eq!(wire[0], RESPONSE_TAG);
        assert_eq!(&wire[1..4], b"\x02s1");
        assert_eq!(Response::decode(&wire).unwrap(), response);
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let wire = Fragment::new("x").encode();
        assert!(Response::decode(&wire).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        let wire = Fragment::new("abc").with_chunk(&b"12345"[..]).encode();
        assert!(Fragment::decode(&wire[..wire.len() - 3]).is_err());

        let mut padded = wire.clone();
        padded.push(0);
        assert!(Fragment::decode(&padded).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let mut wire = Fragment::new("a").encode();
        // tag, len, 'a', flags
        wire[3] = 0x40;
        assert!(matches!(
            Fragment::decode(&wire),
            Err(OffloadError::Protocol(_))
        ));
    }

    #[test]
    fn test_error_response() {
        let err = OffloadError::ModelExecution("boom".into());
        let response = Response::error("s9", ActionSet::from(Action::Inference), &err);
        assert!(response.is_error());
        assert_eq!(response.keypairs[ERROR_KEY], 3);
        let body = response.results_json().unwrap();
        assert_eq!(body["error"]["kind"], "model_execution");
    }

    #[test]
    fn test_timeout_response() {
        let response = Response::timeout("idle");
        assert_eq!(response.keypairs[ERROR_KEY], TIMEOUT_CODE);
        assert!(response.actions.contains(Action::End));
    }

    #[test]
    fn test_response_json_text_results() {
        let response = Response::new("a", ActionSet::empty()).with_results("{\"k\":1}");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["results"], "{\"k\":1}");
        let back: Response = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}
