pub mod config;
pub mod environment;
mod error;
pub mod paths;
pub mod process;
mod validation;

pub use config::{load_config, AppConfig};
pub use environment::{detect, log_profile, DeploymentProfile, DetectionInput, ProfileName};
pub use error::{AppError, ErrorKind, Result};
pub use paths::{PathKey, PathResolver};
pub use process::{AppRecord, ProcessSupervisor, SupervisorMode, SystemRunner};
pub use validation::validate_app_name;
