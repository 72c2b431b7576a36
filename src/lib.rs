// Slipstream: a headless client runtime for simulator UDP circuits.

pub mod config;
pub mod networking;
pub mod recovery;
pub mod utils;
pub mod world;

pub use config::RuntimeConfig;
pub use networking::{Client, ClientEvent};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
