//! Parsing of ErrorResponse / NoticeResponse field payloads.

use crate::errors::Error;

/// Fields of an ErrorResponse or NoticeResponse message, after the
/// message header has been stripped. Only the commonly consulted
/// fields are retained.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
}

impl PgErrorMsg {
    /// Parse the field-tagged payload: a sequence of
    /// `tag-byte + nul-terminated string`, ended by a zero byte.
    pub fn parse(payload: &[u8]) -> Result<PgErrorMsg, Error> {
        let mut msg = PgErrorMsg::default();
        let mut rest = payload;

        loop {
            let (tag, after_tag) = match rest.split_first() {
                Some(pair) => pair,
                None => break,
            };
            if *tag == 0 {
                break;
            }
            let end = match after_tag.iter().position(|&b| b == 0) {
                Some(pos) => pos,
                None => {
                    return Err(Error::ParseBytesError(
                        "error field is not nul-terminated".into(),
                    ))
                }
            };
            let value = String::from_utf8_lossy(&after_tag[..end]).to_string();
            match *tag as char {
                'S' => msg.severity = value,
                'C' => msg.code = value,
                'M' => msg.message = value,
                'D' => msg.detail = Some(value),
                'H' => msg.hint = Some(value),
                'P' => msg.position = value.parse::<u32>().ok(),
                // 'V', 'W', 'q', ... are not consulted.
                _ => (),
            }
            rest = &after_tag[end + 1..];
        }

        if msg.message.is_empty() && msg.severity.is_empty() {
            return Err(Error::ParseBytesError("error message is empty".into()));
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(tag: char, value: &str) -> Vec<u8> {
        let mut buf = vec![tag as u8];
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
        buf
    }

    #[test]
    fn parses_common_fields() {
        let mut payload = Vec::new();
        payload.extend(field('S', "ERROR"));
        payload.extend(field('C', "42P01"));
        payload.extend(field('M', "relation \"x\" does not exist"));
        payload.extend(field('P', "15"));
        payload.push(0);

        let msg = PgErrorMsg::parse(&payload).unwrap();
        assert_eq!(msg.severity, "ERROR");
        assert_eq!(msg.code, "42P01");
        assert_eq!(msg.message, "relation \"x\" does not exist");
        assert_eq!(msg.position, Some(15));
        assert_eq!(msg.detail, None);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut payload = Vec::new();
        payload.extend(field('S', "FATAL"));
        payload.extend(field('V', "FATAL"));
        payload.extend(field('C', "28P01"));
        payload.extend(field('M', "password authentication failed"));
        payload.push(0);

        let msg = PgErrorMsg::parse(&payload).unwrap();
        assert_eq!(msg.code, "28P01");
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(PgErrorMsg::parse(&[0]).is_err());
    }
}
