pub mod config;
pub mod voice;

pub use config::*;
pub use voice::*;
