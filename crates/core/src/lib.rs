// Bitvault Core - Domain, Ports, Backup Engine
// NO infrastructure dependencies: HTTP, git and filesystem adapters live in infra-* crates

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
