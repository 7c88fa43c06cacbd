//! Error types for source analysis

/// Result type for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Failure to turn file text into a [`SourceUnit`](crate::unit::SourceUnit).
///
/// Only raised when the input cannot be tokenized at all. Input that parses
/// but looks odd still produces a (possibly empty) unit. Callers indexing a
/// repository treat both variants as "skip this file and keep going".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// The text could not be tokenized for the requested language
    #[error("malformed {language} input in {path}: {message}")]
    Malformed {
        language: String,
        path: String,
        message: String,
    },

    /// No grammar is available for the requested language
    #[error("unsupported language '{language}' for {path}")]
    Unsupported { language: String, path: String },
}

impl AnalysisError {
    pub fn malformed(
        language: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Malformed {
            language: language.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(language: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Unsupported {
            language: language.into(),
            path: path.into(),
        }
    }

    /// Short machine-readable code, used when the error is recorded on a job.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "analysis_malformed",
            Self::Unsupported { .. } => "analysis_unsupported",
        }
    }
}
