pub mod config;
pub mod logrotate;
pub mod port;
pub mod process_monitor;
pub mod python_env;
pub mod status;
pub mod supervisor;
pub mod utils;
