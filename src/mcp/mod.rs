pub mod error;
pub mod types;

pub use error::McpError;
pub use types::*;
