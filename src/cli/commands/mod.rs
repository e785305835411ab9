//! CLI command implementations.

mod config;
mod resolve;
mod start;

pub use config::{run_config, ConfigArgs};
pub use resolve::{run_resolve, ResolveArgs};
pub use start::{run_start_with_config, StartArgs};
