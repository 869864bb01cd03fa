// Wire protocol: message framing, one-off message builders, and the
// extended-protocol messages the pooler inspects.

pub mod config_socket;
pub mod constants;
pub mod error;
pub mod extended;
pub mod protocol;
pub mod socket;
pub mod types;

pub use config_socket::{configure_tcp_socket, configure_tcp_socket_for_cancel};
pub use error::PgErrorMsg;
pub use extended::{
    bind_statement_name, rewrite_bind, Close, Describe, Parse, REWRITTEN_NAME_PREFIX,
};
pub use protocol::{
    auth_ok, backend_key_data, cancel_request, check_query_response, close_complete,
    command_complete, data_row, data_row_nullable, deallocate_response, error_message,
    error_response, error_response_terminal, md5_challenge, md5_hash_password,
    md5_hash_second_pass, md5_password, md5_password_with_hash, parse_complete, parse_params,
    parse_startup, plain_password_challenge, read_password, ready_for_query, row_description,
    server_parameter_message, simple_query, startup, sync, wrong_password,
};
pub use socket::{
    proxy_copy_data, proxy_copy_data_with_timeout, read_message, read_message_data,
    read_message_header, write_all, write_all_flush,
};
pub use types::{BytesMutReader, DataType};

pub use constants::*;

/// Hard upper bound on any single protocol message the pooler will
/// buffer; `max_packet_size` in the configuration may lower it.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

#[cfg(test)]
mod protocol_tests;
