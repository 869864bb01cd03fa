//! Extended query protocol messages the pooler has to look inside:
//! Parse, Bind, Describe and Close. Everything else is relayed opaquely.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use xxhash_rust::xxh3::Xxh3;

use crate::errors::Error;
use crate::messages::types::BytesMutReader;

/// Prefix of rewritten (pooler-owned) prepared statement names.
pub const REWRITTEN_NAME_PREFIX: &str = "WARDEN_";

/// A Parse ('P') message.
#[derive(Debug, Clone, PartialEq)]
pub struct Parse {
    pub name: String,
    pub query: Arc<str>,
    pub param_types: Vec<i32>,
}

impl Parse {
    /// Decode a complete wire message (code + length + payload).
    pub fn parse(message: &BytesMut) -> Result<Parse, Error> {
        let mut cursor = message.clone();
        let code = cursor.get_u8();
        if code != b'P' {
            return Err(Error::ProtocolSyncError(format!(
                "expected Parse (P), got '{}'",
                code as char
            )));
        }
        let _len = cursor.get_i32();
        let name = cursor.read_string()?;
        let query = cursor.read_string()?;
        if cursor.remaining() < 2 {
            return Err(Error::ParseBytesError("truncated Parse message".into()));
        }
        let num_params = cursor.get_i16();
        if num_params < 0 || cursor.remaining() < num_params as usize * 4 {
            return Err(Error::ParseBytesError("truncated Parse parameters".into()));
        }
        let mut param_types = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            param_types.push(cursor.get_i32());
        }
        Ok(Parse {
            name,
            query: Arc::from(query),
            param_types,
        })
    }

    /// Statement identity: hash of the query text and declared
    /// parameter types. The client-given name deliberately does not
    /// participate, so identical statements share one server-side
    /// definition.
    pub fn query_id(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(self.query.as_bytes());
        for oid in &self.param_types {
            hasher.update(&oid.to_be_bytes());
        }
        hasher.digest()
    }

    /// Produce a copy renamed for the given query id. The name is a
    /// pure function of the id, so a statement keeps one pooler name
    /// for the life of the process no matter how often it is
    /// re-interned.
    pub fn rewrite(&self, query_id: u64) -> Parse {
        Parse {
            name: format!("{REWRITTEN_NAME_PREFIX}{query_id:016x}"),
            query: self.query.clone(),
            param_types: self.param_types.clone(),
        }
    }

}

impl TryFrom<&Parse> for BytesMut {
    type Error = Error;

    fn try_from(parse: &Parse) -> Result<BytesMut, Error> {
        let mut payload = BytesMut::new();
        payload.put_slice(parse.name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(parse.query.as_bytes());
        payload.put_u8(0);
        payload.put_i16(parse.param_types.len() as i16);
        for oid in &parse.param_types {
            payload.put_i32(*oid);
        }

        let mut message = BytesMut::with_capacity(payload.len() + 5);
        message.put_u8(b'P');
        message.put_i32(payload.len() as i32 + 4);
        message.put(payload);
        Ok(message)
    }
}

/// A Close ('C') message. `kind` is b'S' for a statement, b'P' for a portal.
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    pub kind: u8,
    pub name: String,
}

impl Close {
    pub fn new(name: &str) -> Close {
        Close {
            kind: b'S',
            name: name.to_string(),
        }
    }

    pub fn parse(message: &BytesMut) -> Result<Close, Error> {
        let mut cursor = message.clone();
        let code = cursor.get_u8();
        if code != b'C' {
            return Err(Error::ProtocolSyncError(format!(
                "expected Close (C), got '{}'",
                code as char
            )));
        }
        let _len = cursor.get_i32();
        if !cursor.has_remaining() {
            return Err(Error::ParseBytesError("truncated Close message".into()));
        }
        let kind = cursor.get_u8();
        let name = cursor.read_string()?;
        Ok(Close { kind, name })
    }

    pub fn is_statement(&self) -> bool {
        self.kind == b'S'
    }
}

impl TryFrom<&Close> for BytesMut {
    type Error = Error;

    fn try_from(close: &Close) -> Result<BytesMut, Error> {
        let mut message = BytesMut::with_capacity(close.name.len() + 7);
        message.put_u8(b'C');
        message.put_i32(4 + 1 + close.name.len() as i32 + 1);
        message.put_u8(close.kind);
        message.put_slice(close.name.as_bytes());
        message.put_u8(0);
        Ok(message)
    }
}

/// A Describe ('D') message. `kind` is b'S' for a statement, b'P' for a portal.
#[derive(Debug, Clone, PartialEq)]
pub struct Describe {
    pub kind: u8,
    pub name: String,
}

impl Describe {
    pub fn parse(message: &BytesMut) -> Result<Describe, Error> {
        let mut cursor = message.clone();
        let code = cursor.get_u8();
        if code != b'D' {
            return Err(Error::ProtocolSyncError(format!(
                "expected Describe (D), got '{}'",
                code as char
            )));
        }
        let _len = cursor.get_i32();
        if !cursor.has_remaining() {
            return Err(Error::ParseBytesError("truncated Describe message".into()));
        }
        let kind = cursor.get_u8();
        let name = cursor.read_string()?;
        Ok(Describe { kind, name })
    }

    pub fn is_statement(&self) -> bool {
        self.kind == b'S'
    }

    /// Re-serialize with a different statement name.
    pub fn rename(&self, name: &str) -> BytesMut {
        let mut message = BytesMut::with_capacity(name.len() + 7);
        message.put_u8(b'D');
        message.put_i32(4 + 1 + name.len() as i32 + 1);
        message.put_u8(self.kind);
        message.put_slice(name.as_bytes());
        message.put_u8(0);
        message
    }
}

/// Extract the statement name a Bind ('B') message refers to.
pub fn bind_statement_name(message: &BytesMut) -> Result<String, Error> {
    let mut cursor = message.clone();
    let code = cursor.get_u8();
    if code != b'B' {
        return Err(Error::ProtocolSyncError(format!(
            "expected Bind (B), got '{}'",
            code as char
        )));
    }
    let _len = cursor.get_i32();
    let _portal = cursor.read_string()?;
    cursor.read_string()
}

/// Re-serialize a Bind message with the statement name replaced; the
/// portal name, parameter formats and values are carried over verbatim.
pub fn rewrite_bind(message: &BytesMut, statement: &str) -> Result<BytesMut, Error> {
    let mut cursor = message.clone();
    let code = cursor.get_u8();
    if code != b'B' {
        return Err(Error::ProtocolSyncError(format!(
            "expected Bind (B), got '{}'",
            code as char
        )));
    }
    let _len = cursor.get_i32();
    let portal = cursor.read_string()?;
    let _old_statement = cursor.read_string()?;
    // `cursor` now holds the remainder: formats, values, result formats.

    let mut payload = BytesMut::with_capacity(portal.len() + statement.len() + cursor.remaining() + 2);
    payload.put_slice(portal.as_bytes());
    payload.put_u8(0);
    payload.put_slice(statement.as_bytes());
    payload.put_u8(0);
    payload.put_slice(&cursor);

    let mut out = BytesMut::with_capacity(payload.len() + 5);
    out.put_u8(b'B');
    out.put_i32(payload.len() as i32 + 4);
    out.put(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_message(name: &str, query: &str, types: &[i32]) -> BytesMut {
        let parse = Parse {
            name: name.to_string(),
            query: Arc::from(query),
            param_types: types.to_vec(),
        };
        (&parse).try_into().unwrap()
    }

    #[test]
    fn parse_round_trip() {
        let wire = parse_message("stmt1", "SELECT $1", &[23]);
        let parsed = Parse::parse(&wire).unwrap();
        assert_eq!(parsed.name, "stmt1");
        assert_eq!(&*parsed.query, "SELECT $1");
        assert_eq!(parsed.param_types, vec![23]);
    }

    #[test]
    fn query_id_ignores_name() {
        let a = Parse::parse(&parse_message("a", "SELECT 1", &[])).unwrap();
        let b = Parse::parse(&parse_message("b", "SELECT 1", &[])).unwrap();
        assert_eq!(a.query_id(), b.query_id());

        let c = Parse::parse(&parse_message("a", "SELECT 2", &[])).unwrap();
        assert_ne!(a.query_id(), c.query_id());
    }

    #[test]
    fn query_id_considers_param_types() {
        let a = Parse::parse(&parse_message("a", "SELECT $1", &[23])).unwrap();
        let b = Parse::parse(&parse_message("a", "SELECT $1", &[25])).unwrap();
        assert_ne!(a.query_id(), b.query_id());
    }

    #[test]
    fn rewrite_is_deterministic_per_query_id() {
        let parse = Parse::parse(&parse_message("orig", "SELECT 1", &[])).unwrap();
        let id = parse.query_id();
        let one = parse.rewrite(id);
        let two = parse.rewrite(id);
        assert!(one.name.starts_with(REWRITTEN_NAME_PREFIX));
        assert_eq!(one.name, two.name);
        assert_eq!(one.query, two.query);

        // A different statement maps to a different name; a client
        // re-parsing under another client-side label does not.
        let other = Parse::parse(&parse_message("relabeled", "SELECT 2", &[])).unwrap();
        assert_ne!(other.rewrite(other.query_id()).name, one.name);
        let relabeled = Parse::parse(&parse_message("relabeled", "SELECT 1", &[])).unwrap();
        assert_eq!(relabeled.rewrite(relabeled.query_id()).name, one.name);
    }

    #[test]
    fn bind_rewrite_preserves_parameters() {
        let mut payload = BytesMut::new();
        payload.put_slice(b"portal\0old_name\0");
        payload.put_i16(0); // no format codes
        payload.put_i16(1); // one parameter
        payload.put_i32(3);
        payload.put_slice(b"abc");
        payload.put_i16(0); // no result formats

        let mut wire = BytesMut::new();
        wire.put_u8(b'B');
        wire.put_i32(payload.len() as i32 + 4);
        wire.put(payload);

        assert_eq!(bind_statement_name(&wire).unwrap(), "old_name");

        let rewritten = rewrite_bind(&wire, "WARDEN_9").unwrap();
        assert_eq!(bind_statement_name(&rewritten).unwrap(), "WARDEN_9");
        // Parameter bytes survive verbatim after the two names.
        assert!(rewritten.ends_with(&[0, 1, 0, 0, 0, 3, b'a', b'b', b'c', 0, 0]));
    }

    #[test]
    fn close_round_trip() {
        let close = Close::new("WARDEN_1");
        let wire: BytesMut = (&close).try_into().unwrap();
        let parsed = Close::parse(&wire).unwrap();
        assert!(parsed.is_statement());
        assert_eq!(parsed.name, "WARDEN_1");
    }
}
