//! Configuration module for flowstate
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use flowstate::config::load_config;
//!
//! let config = load_config("/etc/flowstate/config.json").unwrap();
//! println!("Max records: {}", config.table.max_records);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{FlowTableConfig, LogConfig, SimulatorConfig, MAX_LIFETIME_SECS};
