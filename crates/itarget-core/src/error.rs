//! Error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // External Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("'{tool}' not found. Ensure it is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("Failed to spawn process: {reason}")]
    Spawn { reason: String },

    #[error("{command} exited with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ─────────────────────────────────────────────────────────────
    // Target Operation Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Source \"{name}\" is not available")]
    SourceUnavailable { name: String },

    #[error("Could not install app on {udid}: {reason}")]
    InstallFailed { udid: String, reason: String },

    #[error("Could not launch {bundle_id} on {udid} and get pid")]
    LaunchFailed { bundle_id: String, udid: String },

    #[error("Could not start debugserver on {udid} and get port")]
    DebugserverFailed { udid: String },

    #[error("Could not find pid for {bundle_id}")]
    PidNotFound { bundle_id: String },

    // ─────────────────────────────────────────────────────────────
    // Selection Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No target found for udid {udid}")]
    TargetNotFound { udid: String },

    #[error("Selected target {udid} is not a {expected}")]
    TargetMismatch { expected: &'static str, udid: String },

    #[error("No target selected")]
    NoTargetSelected,

    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("State store error: {message}")]
    Store { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn spawn(reason: impl Into<String>) -> Self {
        Self::Spawn {
            reason: reason.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn source_unavailable(source: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            name: source.to_string(),
        }
    }

    pub fn install_failed(udid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InstallFailed {
            udid: udid.into(),
            reason: reason.into(),
        }
    }

    pub fn launch_failed(bundle_id: impl Into<String>, udid: impl Into<String>) -> Self {
        Self::LaunchFailed {
            bundle_id: bundle_id.into(),
            udid: udid.into(),
        }
    }

    pub fn debugserver_failed(udid: impl Into<String>) -> Self {
        Self::DebugserverFailed { udid: udid.into() }
    }

    pub fn pid_not_found(bundle_id: impl Into<String>) -> Self {
        Self::PidNotFound {
            bundle_id: bundle_id.into(),
        }
    }

    pub fn target_not_found(udid: impl Into<String>) -> Self {
        Self::TargetNotFound { udid: udid.into() }
    }

    pub fn target_mismatch(expected: &'static str, udid: impl Into<String>) -> Self {
        Self::TargetMismatch {
            expected,
            udid: udid.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
