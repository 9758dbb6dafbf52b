use std::process::ExitCode;

/// Errors that cause fleetd to exit with a specific code. Anything else
/// exits with the generic failure code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("fetching {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("{failed} of {total} boot scripts failed")]
    ScriptsFailed { failed: usize, total: usize },

    #[error("queue unavailable: {0}")]
    Queue(String),
}

impl ExitError {
    const fn code(&self) -> u8 {
        match self {
            ExitError::Config(_) => 2,
            ExitError::Fetch { .. } => 3,
            ExitError::ScriptsFailed { .. } => 4,
            ExitError::Queue(_) => 5,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}
