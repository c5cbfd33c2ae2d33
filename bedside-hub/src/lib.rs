extern crate self as bedside_hub;

pub mod config;
pub mod gpio;
pub mod http;
pub mod logging;
pub mod routes;

pub use config::{Config, ConfigError, config_path};
pub use gpio::{MemoryPin, RelayController, RelayError};
pub use routes::App;
