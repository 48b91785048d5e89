//! Error types for provisioning operations.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("no network token defined")]
    MissingCredential,

    #[error("invalid vpn option {key}: {reason}")]
    InvalidOption { key: String, reason: &'static str },

    #[error("could not create svc for instance {instance}: {message}")]
    ServiceHandle { instance: String, message: String },

    #[error("could not serialize {what}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("could not create dns config {}", path.display())]
    ConfigPersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not create directory {}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write env file {}", path.display())]
    EnvWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure inside a service handle while writing its definition.
    #[error("could not write {}", path.display())]
    UnitFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write unit file")]
    UnitWrite(#[source] Box<ProvisionError>),

    #[error("could not start svc")]
    ServiceStart(#[source] Box<ProvisionError>),

    #[error("could not enable svc")]
    ServiceEnable(#[source] Box<ProvisionError>),

    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Permission denied. Run with sudo.")]
    PermissionDenied,
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
