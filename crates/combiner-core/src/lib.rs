pub mod config;
pub mod error;
pub mod models;

pub use config::{AppConfig, CrmConfig, PathsConfig, ProfileArguments, ProfileOptions, RunProfile};
pub use error::{CoreError, ExitCode, Result};
pub use models::*;
