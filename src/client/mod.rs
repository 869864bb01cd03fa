mod core;
mod entrypoint;
mod requests;
mod session;
mod startup;

pub use self::core::Client;
pub use entrypoint::{client_entrypoint, client_entrypoint_too_many_clients_already};
pub use requests::{OutstandingRequest, OutstandingRequests, ResponseAction, StatementEffect};
