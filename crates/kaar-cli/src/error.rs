//! CLI error types with exit code handling
//!
//! Each variant names the operation that failed so the user sees
//! `unable to create kaarball: ...` rather than a bare library error.

use kaar_core::KaarError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// Conflicting or incomplete invocation, detected before any I/O
    #[error("invalid usage: {message}")]
    #[diagnostic(code(kaar::cli::usage))]
    Usage {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("unable to create kaarball: {message}")]
    #[diagnostic(code(kaar::cli::create))]
    Create {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("unable to extract kaarball: {message}")]
    #[diagnostic(code(kaar::cli::extract))]
    Extract {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("unable to list kaarball: {message}")]
    #[diagnostic(code(kaar::cli::list))]
    List { message: String },

    #[error("unable to load configuration: {message}")]
    #[diagnostic(code(kaar::cli::config))]
    Config { message: String },

    /// Internal error (runtime, unexpected failure)
    #[error("Internal error: {message}")]
    #[diagnostic(code(kaar::cli::internal))]
    Internal { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage { .. }
            | CliError::Create { .. }
            | CliError::Extract { .. }
            | CliError::List { .. }
            | CliError::Config { .. }
            | CliError::Internal { .. } => exit_codes::ERROR,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: None,
        }
    }

    pub fn usage_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn create(err: KaarError) -> Self {
        Self::Create {
            help: help_for(&err),
            message: err.to_string(),
        }
    }

    pub fn extract(err: KaarError) -> Self {
        Self::Extract {
            help: help_for(&err),
            message: err.to_string(),
        }
    }

    pub fn list(err: KaarError) -> Self {
        Self::List {
            message: err.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

fn help_for(err: &KaarError) -> Option<String> {
    match err {
        KaarError::Conflict { .. } => {
            Some("Use --overwrite to replace existing files".to_string())
        }
        KaarError::CorruptArchive { .. } => {
            Some("The kaarball is truncated or damaged; create it again".to_string())
        }
        _ => None,
    }
}

impl From<KaarError> for CliError {
    fn from(err: KaarError) -> Self {
        match err {
            KaarError::Config { message } => CliError::Config { message },
            other => CliError::internal(other.to_string()),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_operation() {
        let err = CliError::create(KaarError::io(
            "/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        ));
        assert!(err.to_string().starts_with("unable to create kaarball: "));

        let err = CliError::extract(KaarError::corrupt("bad magic"));
        assert_eq!(err.to_string(), "unable to extract kaarball: corrupt kaarball: bad magic");
    }

    #[test]
    fn test_every_error_exits_with_one() {
        assert_eq!(CliError::usage("x").exit_code(), 1);
        assert_eq!(CliError::extract(KaarError::Cancelled).exit_code(), 1);
        assert_eq!(CliError::internal("x").exit_code(), 1);
    }

    #[test]
    fn test_conflict_has_help() {
        let err = CliError::extract(KaarError::Conflict {
            path: "out/README.md".into(),
        });
        match err {
            CliError::Extract { help, .. } => assert!(help.unwrap().contains("--overwrite")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
