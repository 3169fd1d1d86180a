pub mod api;
pub mod chain;
pub mod flow;
pub mod time;

pub mod tokio;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
