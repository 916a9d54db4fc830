pub mod app;
pub mod config;
pub mod env;
pub mod runtime;
pub mod serve;

pub use app::run;
pub use config::{cmd_config, ConfigArgs};
pub use env::{CliArgs, Commands};
pub use serve::{cmd_serve, ServeArgs};
