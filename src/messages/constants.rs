//! PostgreSQL v3 wire protocol constants.

/// Version 3.0 startup code.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;
/// Obsolete version 2.0 startup code, recognized only to reject it cleanly.
pub const PROTOCOL_VERSION_NUMBER_V2: i32 = 131072;
/// CancelRequest pseudo-version.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
/// SSLRequest pseudo-version.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// GSSENCRequest pseudo-version.
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

// Authentication request codes ('R' message payload).
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

pub const MESSAGE_TERMINATOR: u8 = 0;

/// Issued cancel keys carry a forwarding TTL in the low two bits,
/// compatible with poolers that forward CancelRequest between peers.
pub const CANCEL_KEY_TTL_MASK: u8 = 0x03;
