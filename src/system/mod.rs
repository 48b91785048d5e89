//! Node-side artifacts and collaborators: cloud-configs, env files, the
//! service manager, and the inline config executor.

pub mod cloud_config;
pub mod env_file;
pub mod inline;
pub mod service;

pub use inline::{CommandExecutor, InlineExecutor, NoopExecutor};
pub use service::{InitSystemFactory, ServiceFactory, ServiceHandle};
