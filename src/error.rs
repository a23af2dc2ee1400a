use std::time::Duration;

use thiserror::Error;

use crate::link::ControllerRole;

/// Top-level error type for the sortbin control loop.
///
/// Each hardware-facing component has its own error enum so callers can
/// branch on kind; this umbrella carries them across module boundaries.
#[derive(Error, Debug)]
pub enum SortbinError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error("no compartment route for category {category:?}")]
    UnmappedCategory { category: String },

    #[error("malformed response in {stage}: {details}")]
    MalformedResponse { stage: &'static str, details: String },
}

impl SortbinError {
    /// Whether the error can be resolved by retrying or restarting the
    /// session. Absent hardware and programming errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SortbinError::Config(_) => false,
            SortbinError::Discovery(_) => false,
            SortbinError::Camera(CameraError::NoReference) => false,
            _ => true,
        }
    }
}

/// Controller discovery failures. These are surfaced to the operator and
/// never silently defaulted: no amount of in-process retry fixes absent
/// hardware.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no serial ports available to probe")]
    NoPorts,

    #[error("no controller answered the handshake for role(s): {}", format_roles(.missing))]
    RolesMissing { missing: Vec<ControllerRole> },
}

fn format_roles(roles: &[ControllerRole]) -> String {
    roles
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Serial link failures on an established controller binding.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("{role} controller did not respond within {timeout:?}")]
    Timeout {
        role: ControllerRole,
        timeout: Duration,
    },

    #[error("serial I/O failure on {role} controller: {source}")]
    Io {
        role: ControllerRole,
        source: std::io::Error,
    },
}

/// Camera acquisition and frame read failures.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("failed to open camera: {details}")]
    Open { details: String },

    #[error("failed to read a frame: {details}")]
    Frame { details: String },

    /// detect() was called before capture_reference(); a programming error,
    /// not a hardware fault.
    #[error("detect called before a reference frame was captured")]
    NoReference,
}

/// Classification gateway failures. Both kinds forfeit the current cycle
/// rather than failing it.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classification request failed: {details}")]
    Request { details: String },

    #[error("classification payload did not parse: {details}")]
    MalformedPayload { details: String },
}

pub type Result<T> = std::result::Result<T, SortbinError>;
