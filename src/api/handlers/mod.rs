pub mod commands;
pub mod system;

pub use commands::*;
pub use system::*;
