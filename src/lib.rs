pub mod azure;
pub mod config;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod logging;
pub mod report;
