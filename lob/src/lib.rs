//! Binary packet envelope used throughout the mesh: a 2-byte big-endian head
//! length, opaque head bytes, and an opaque body. The head is either raw
//! bytes (a cipher-set id, a short hashname, or empty) or a UTF-8 JSON
//! object, distinguished purely by its length and first byte.

use byteorder::{BigEndian, ByteOrder};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LobError {
    #[error("buffer shorter than the 2-byte head length prefix")]
    Truncated,
    #[error("head length {0} exceeds remaining buffer")]
    HeadOverrun(usize),
    #[error("invalid JSON head: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// How a packet's head classifies it for dispatch, per the wire format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `head_len == 0`: zero-head channel packet, body starts with a routing token.
    Channel,
    /// `head_len == 1`: handshake, head byte is the cipher-set id.
    Handshake(u8),
    /// `head_len == 5`: routed packet, head is a short hashname.
    Routed,
    /// `head_len >= 2` and the head parses as a JSON object.
    Json,
    /// Anything else: head_len in 2..5 that isn't JSON, or an unrecognized shape.
    Unknown,
}

/// The envelope type carried between every layer of the mesh: framing,
/// handshakes, channel payloads and JSON control messages all ride in one of
/// these, optionally chained to another packet via [`Packet::link`].
#[derive(Debug, Clone, Default)]
pub struct Packet {
    head: Vec<u8>,
    body: Vec<u8>,
    linked: Option<Box<Packet>>,
    /// Free-form sequence/timestamp tag used by higher layers; the mesh
    /// itself only ever writes the handshake cache timestamp into it.
    pub id: i64,
}

impl Packet {
    pub fn new() -> Self {
        Packet::default()
    }

    pub fn with_body(body: Vec<u8>) -> Self {
        Packet { body, ..Default::default() }
    }

    /// Build a zero-head channel packet.
    pub fn channel(body: Vec<u8>) -> Self {
        Packet::with_body(body)
    }

    /// Build a single-byte handshake head packet for the given cipher-set id.
    pub fn handshake(csid: u8, body: Vec<u8>) -> Self {
        Packet { head: vec![csid], body, ..Default::default() }
    }

    /// Build a routed packet addressed by a 5-byte short hashname.
    pub fn routed(short_hashname: [u8; 5], body: Vec<u8>) -> Self {
        Packet { head: short_hashname.to_vec(), body, ..Default::default() }
    }

    /// Parse `head_len ‖ head ‖ body` from a wire buffer.
    pub fn parse(buf: &[u8]) -> Result<Self, LobError> {
        if buf.len() < 2 {
            return Err(LobError::Truncated);
        }
        let head_len = BigEndian::read_u16(&buf[0..2]) as usize;
        if buf.len() < 2 + head_len {
            return Err(LobError::HeadOverrun(head_len));
        }
        Ok(Packet {
            head: buf[2..2 + head_len].to_vec(),
            body: buf[2 + head_len..].to_vec(),
            linked: None,
            id: 0,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.head.len() + self.body.len());
        let mut len_buf = [0u8; 2];
        BigEndian::write_u16(&mut len_buf, self.head.len() as u16);
        out.extend_from_slice(&len_buf);
        out.extend_from_slice(&self.head);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn len(&self) -> usize {
        2 + self.head.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.body.is_empty()
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn head_len(&self) -> usize {
        self.head.len()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn set_head_raw(&mut self, head: Vec<u8>) {
        self.head = head;
    }

    pub fn kind(&self) -> Kind {
        match self.head.len() {
            0 => Kind::Channel,
            1 => Kind::Handshake(self.head[0]),
            5 => Kind::Routed,
            n if n >= 2 && self.head[0] >= 0x20 => Kind::Json,
            _ => Kind::Unknown,
        }
    }

    fn is_json_head(&self) -> bool {
        self.head.len() >= 2 && self.head[0] >= 0x20
    }

    /// Parse the head as JSON, if it looks like one. Logs and returns `None`
    /// on malformed JSON rather than failing the whole packet.
    pub fn json(&self) -> Option<Value> {
        if !self.is_json_head() {
            return None;
        }
        match serde_json::from_slice(&self.head) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("bad json head ({} bytes): {}", self.head.len(), e);
                None
            }
        }
    }

    fn json_map(&self) -> Map<String, Value> {
        match self.json() {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.json_map().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        let mut m = self.json_map();
        m.insert(key.to_string(), value.into());
        self.head = Value::Object(m).to_string().into_bytes();
    }

    /// Merge a pre-encoded JSON fragment under `key` without re-serializing
    /// it from a `Value` first — used to splice an already-built sub-object
    /// (e.g. a nested `keys` packet's head) straight into this head.
    pub fn set_raw(&mut self, key: &str, raw_json: &[u8]) -> Result<(), LobError> {
        let value: Value = serde_json::from_slice(raw_json)?;
        self.set(key, value);
        Ok(())
    }

    /// Chain `outer` onto this packet (e.g. a decrypted inner packet linked
    /// back to the outer ciphertext it came from).
    pub fn link(&mut self, outer: Packet) {
        self.linked = Some(Box::new(outer));
    }

    pub fn linked(&self) -> Option<&Packet> {
        self.linked.as_deref()
    }

    pub fn take_linked(&mut self) -> Option<Packet> {
        self.linked.take().map(|b| *b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let pkt = Packet::channel(vec![1, 2, 3, 4]);
        let bytes = pkt.to_bytes();
        assert_eq!(bytes, vec![0, 0, 1, 2, 3, 4]);
        let back = Packet::parse(&bytes).unwrap();
        assert_eq!(back.body(), &[1, 2, 3, 4]);
        assert_eq!(back.kind(), Kind::Channel);
    }

    #[test]
    fn classifies_by_head_len() {
        assert_eq!(Packet::handshake(0x1a, vec![]).kind(), Kind::Handshake(0x1a));
        assert_eq!(Packet::routed([1, 2, 3, 4, 5], vec![]).kind(), Kind::Routed);

        let mut json_pkt = Packet::new();
        json_pkt.set("type", "link");
        assert_eq!(json_pkt.kind(), Kind::Json);

        // head_len 3, not JSON (first byte < 0x20) -> Unknown, per the
        // spec's open question on undefined non-JSON short heads.
        let weird = Packet { head: vec![0x01, 0x02, 0x03], ..Default::default() };
        assert_eq!(weird.kind(), Kind::Unknown);
    }

    #[test]
    fn json_head_accessors_round_trip() {
        let mut pkt = Packet::new();
        pkt.set("hashname", "abc");
        pkt.set("at", 42u64);
        assert_eq!(pkt.get_str("hashname").as_deref(), Some("abc"));
        assert_eq!(pkt.get_u64("at"), Some(42));

        let reparsed = Packet::parse(&pkt.to_bytes()).unwrap();
        assert_eq!(reparsed.get_str("hashname").as_deref(), Some("abc"));
    }

    #[test]
    fn set_raw_merges_preencoded_fragment() {
        let mut pkt = Packet::new();
        pkt.set_raw("keys", br#"{"1a":"deadbeef"}"#).unwrap();
        let keys = pkt.get("keys").unwrap();
        assert_eq!(keys["1a"], "deadbeef");
    }

    #[test]
    fn linking_chains_a_packet() {
        let mut inner = Packet::channel(vec![9]);
        let outer = Packet::handshake(0x1a, vec![1, 2, 3]);
        inner.link(outer);
        assert_eq!(inner.linked().unwrap().head(), &[0x1a]);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        assert!(matches!(Packet::parse(&[0]), Err(LobError::Truncated)));
        assert!(matches!(Packet::parse(&[0, 5, 1, 2]), Err(LobError::HeadOverrun(5))));
    }
}
