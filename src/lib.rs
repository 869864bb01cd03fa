pub mod admin;
pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod messages;
pub mod pool;
pub mod server;
pub mod stats;
pub mod utils;

pub use app::logger;

/// Render a session duration as `Nd HH:MM:SS.mmm` for the log lines.
pub fn format_duration(duration: &chrono::Duration) -> String {
    format!(
        "{}d {:0>2}:{:0>2}:{:0>2}.{:0>3}",
        duration.num_days(),
        duration.num_hours() % 24,
        duration.num_minutes() % 60,
        duration.num_seconds() % 60,
        duration.num_milliseconds() % 1000,
    )
}
