//! Tests for protocol message handling.

use bytes::{Buf, BytesMut};

use super::protocol::*;
use super::types::DataType;

#[test]
fn test_simple_query_framing() {
    let msg = simple_query("SELECT 1");
    assert_eq!(msg[0], b'Q');
    let len = i32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
    assert_eq!(len as usize, msg.len() - 1);
    assert_eq!(&msg[5..13], b"SELECT 1");
    assert_eq!(msg[13], 0);
}

#[test]
fn test_ready_for_query_status_byte() {
    assert_eq!(ready_for_query(false).as_ref(), &[b'Z', 0, 0, 0, 5, b'I']);
    assert_eq!(ready_for_query(true).as_ref(), &[b'Z', 0, 0, 0, 5, b'T']);
}

#[test]
fn test_error_message_carries_code_and_text() {
    let msg = error_message("sorry, too many clients already", "53300");
    assert_eq!(msg[0], b'E');
    let body = &msg[5..];
    let text = String::from_utf8_lossy(body);
    assert!(text.contains("53300"));
    assert!(text.contains("sorry, too many clients already"));
    // Field list terminator before end of message.
    assert_eq!(msg[msg.len() - 1], 0);
}

#[test]
fn test_md5_hash_password_matches_postgres() {
    // Equivalent of PostgreSQL's md5 auth exchange:
    // md5(md5(password + user) + salt), hex-encoded with "md5" prefix.
    let hashed = md5_hash_password("alice", "secret", &[0x01, 0x02, 0x03, 0x04]);
    assert!(hashed.starts_with(b"md5"));
    assert_eq!(hashed.len(), 3 + 32 + 1);
    assert_eq!(*hashed.last().unwrap(), 0);

    // Second pass over a stored md5 secret produces the same bytes.
    let first_pass = {
        use md5::{Digest, Md5};
        let mut md5 = Md5::new();
        md5.update(b"secret");
        md5.update(b"alice");
        format!("{:x}", md5.finalize())
    };
    let second = md5_hash_second_pass(&first_pass, &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(hashed, second);
}

#[test]
fn test_parse_params_key_values() {
    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(b"user\0postgres\0database\0app_db\0");
    let params = parse_params(bytes).unwrap();
    assert_eq!(params.get("user").unwrap(), "postgres");
    assert_eq!(params.get("database").unwrap(), "app_db");
}

#[test]
fn test_parse_params_rejects_odd_count() {
    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(b"user\0postgres\0stray\0");
    assert!(parse_params(bytes).is_err());
}

#[test]
fn test_parse_startup_requires_user() {
    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(b"database\0app_db\0");
    assert!(parse_startup(bytes).is_err());
}

#[test]
fn test_row_description_and_data_row() {
    let desc = row_description(&[("database", DataType::Text), ("port", DataType::Int4)]);
    assert_eq!(desc[0], b'T');
    let mut cursor = desc.clone();
    cursor.advance(5);
    assert_eq!(cursor.get_i16(), 2);

    let row = data_row(&["app_db".to_string(), "5432".to_string()]);
    assert_eq!(row[0], b'D');
    let mut cursor = row.clone();
    cursor.advance(5);
    assert_eq!(cursor.get_i16(), 2);
    assert_eq!(cursor.get_i32(), 6);
}

#[test]
fn test_data_row_nullable_encodes_null_as_minus_one() {
    let row = data_row_nullable(&[None, Some("x".to_string())]);
    let mut cursor = row.clone();
    cursor.advance(5);
    assert_eq!(cursor.get_i16(), 2);
    assert_eq!(cursor.get_i32(), -1);
    assert_eq!(cursor.get_i32(), 1);
}

#[test]
fn test_cancel_request_layout() {
    let msg = cancel_request(1234, 5678);
    let mut cursor = msg.clone();
    assert_eq!(cursor.get_i32(), 16);
    assert_eq!(cursor.get_i32(), super::constants::CANCEL_REQUEST_CODE);
    assert_eq!(cursor.get_i32(), 1234);
    assert_eq!(cursor.get_i32(), 5678);
}

#[test]
fn test_backend_key_data_layout() {
    let msg = backend_key_data(77, -12);
    let mut cursor = msg.clone();
    assert_eq!(cursor.get_u8(), b'K');
    assert_eq!(cursor.get_i32(), 12);
    assert_eq!(cursor.get_i32(), 77);
    assert_eq!(cursor.get_i32(), -12);
}

#[test]
fn test_check_query_response_is_empty_query_plus_rfq() {
    let msg = check_query_response();
    assert_eq!(msg.as_ref(), &[b'I', 0, 0, 0, 4, b'Z', 0, 0, 0, 5, b'I']);
}
