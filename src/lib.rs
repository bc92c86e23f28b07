pub mod config;
pub mod handlers;
pub mod logging;
pub mod protection;

pub const PUNISHMENT_TARGET: &str = "antinuke_daemon::punishment";
pub const ERROR_TARGET: &str = "antinuke_daemon::error";
pub const EVENT_TARGET: &str = "antinuke_daemon::handlers";
pub const CONSOLE_TARGET: &str = "antinuke_daemon";

pub use config::Settings;
pub use protection::ProtectionService;
pub type Error = Box<dyn std::error::Error + Send + Sync>;
