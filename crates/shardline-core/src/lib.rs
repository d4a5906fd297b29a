pub mod config;
pub mod ident;

pub use config::EngineConfig;
pub use ident::{IdentError, validate_identifier};
