//! Errors.

use std::fmt;

/// Various errors.
#[derive(Debug, PartialEq)]
pub enum Error {
    SocketError(String),
    ClientSocketError(String, ClientIdentifier),
    ClientBadStartup,
    ClientError(String),
    ProtocolSyncError(String),
    ServerError(String),
    ServerStartupError(String, ServerIdentifier),
    ServerAuthError(String, ServerIdentifier),
    ScramClientError(String),
    AuthError(String),
    BadConfig(String),
    AdmissionError(String),
    AllServersDown,
    ShuttingDown,
    FlushTimeout,
    QueryTimeout,
    MaxMessageSize,
    PreparedStatementError,
    ParseBytesError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SocketError(msg) => write!(f, "socket error: {msg}"),
            Error::ClientSocketError(what, id) => write!(f, "error reading {what} from {id}"),
            Error::ClientBadStartup => write!(f, "client sent a bad startup message"),
            Error::ClientError(msg) => write!(f, "client error: {msg}"),
            Error::ProtocolSyncError(msg) => write!(f, "protocol synchronization error: {msg}"),
            Error::ServerError(msg) => write!(f, "server error: {msg}"),
            Error::ServerStartupError(what, id) => {
                write!(f, "error reading {what} on server startup {id}")
            }
            Error::ServerAuthError(msg, id) => {
                write!(f, "server authentication failed for {id}: {msg}")
            }
            Error::ScramClientError(msg) => write!(f, "SCRAM client error: {msg}"),
            Error::AuthError(msg) => write!(f, "authentication error: {msg}"),
            Error::BadConfig(msg) => write!(f, "configuration error: {msg}"),
            Error::AdmissionError(msg) => write!(f, "connection rejected: {msg}"),
            Error::AllServersDown => write!(f, "no server connection could be obtained"),
            Error::ShuttingDown => write!(f, "shutting down"),
            Error::FlushTimeout => write!(f, "timed out flushing data to the server"),
            Error::QueryTimeout => write!(f, "query timed out"),
            Error::MaxMessageSize => write!(f, "message exceeds max_packet_size"),
            Error::PreparedStatementError => write!(f, "prepared statement not found"),
            Error::ParseBytesError(msg) => write!(f, "failed to parse message bytes: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub application_name: String,
    pub username: String,
    pub pool_name: String,
}

impl ClientIdentifier {
    pub fn new(
        application_name: &str,
        username: &str,
        pool_name: &str,
        addr: &str,
    ) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            application_name: application_name.into(),
            username: username.into(),
            pool_name: pool_name.into(),
        }
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self {
            addr,
            application_name,
            username,
            pool_name,
        } = self;
        write!(
            f,
            "{{ {username}@{addr}/{pool_name}?application_name={application_name} }}",
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: &str, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username: username.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self { username, database } = self;
        write!(f, "{{ username: {username}, database: {database} }}")
    }
}
