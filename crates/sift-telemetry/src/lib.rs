pub mod error;
mod logger;
pub mod telemetry;

pub use telemetry::{init_telemetry, shutdown_telemetry};
