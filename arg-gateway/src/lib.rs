//! Configuration loading, logging, director dispatch, and the `Gateway`
//! bundle that ties them to a running process.

pub mod config;
pub mod director;
pub mod exitcode;
pub mod gateway;
pub mod logging;

pub use config::Config;
pub use gateway::Gateway;
