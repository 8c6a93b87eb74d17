use std::path::PathBuf;

use thiserror::Error;

/// Failure classes surfaced by a crawl job.
///
/// Every variant is rendered into the `error` field of the canonical result, so
/// the message must be self-contained for an operator reading the stored record.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Missing or invalid request fields, unsupported host or skill. Raised
    /// before any subprocess runs.
    #[error("invalid crawl request: {0}")]
    Input(String),

    /// The agent subprocess failed, timed out or was killed.
    #[error("{tool} execution failed: {message}")]
    Execution { tool: String, message: String },

    /// No contract-shaped JSON object could be recovered from agent output.
    #[error("{0}")]
    Extraction(String),

    /// A referenced artifact file is missing, unreadable or unparseable.
    #[error("artifact {}: {message}", path.display())]
    Artifact { path: PathBuf, message: String },

    /// Well-formed JSON that fails the output contract.
    #[error("output contract validation failed: {0}")]
    Contract(String),
}

impl CrawlError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn execution(tool: &str, err: &anyhow::Error) -> Self {
        Self::Execution {
            tool: tool.to_owned(),
            message: format!("{err:#}"),
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, err: &anyhow::Error) -> Self {
        Self::Artifact {
            path: path.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Execution { .. } => "execution",
            Self::Extraction(_) => "extraction",
            Self::Artifact { .. } => "artifact",
            Self::Contract(_) => "contract",
        }
    }
}
