use bytes::{Buf, BytesMut};

use crate::errors::Error;

/// Column types used when the pooler fabricates result sets (admin console).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Text,
    Int4,
    Numeric,
    Bool,
    Oid,
}

impl From<&DataType> for i32 {
    fn from(data_type: &DataType) -> i32 {
        match data_type {
            DataType::Text => 25,
            DataType::Int4 => 23,
            DataType::Numeric => 1700,
            DataType::Bool => 16,
            DataType::Oid => 26,
        }
    }
}

/// Read a nul-terminated C string out of a message buffer.
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self) -> Result<String, Error> {
        let end = match self.iter().position(|&b| b == 0) {
            Some(pos) => pos,
            None => {
                return Err(Error::ParseBytesError(
                    "string is not nul-terminated".into(),
                ))
            }
        };
        let s = String::from_utf8_lossy(&self[..end]).to_string();
        self.advance(end + 1);
        Ok(s)
    }
}
