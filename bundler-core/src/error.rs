//! Typed error handling for the bundler.
//!
//! Provides structured errors that library consumers can match on,
//! with full context about what went wrong and where.

use std::path::PathBuf;
use thiserror::Error;

use crate::diagnostics::Diagnostic;

/// Main error type for bundler operations.
///
/// Mirrors the five-kind taxonomy from the error-handling design: a missing
/// specifier, a syntactic pattern the transformer refuses, a contract
/// violation in the core, two bundles targeting the same output, and a
/// wrapped diagnostic from the parser.
#[derive(Error, Debug)]
pub enum BundlerError {
    /// A specifier could not be resolved to a local module or a known
    /// external mode.
    #[error("module not found: '{specifier}' referenced from {from}")]
    ModuleNotFound { specifier: String, from: PathBuf },

    /// A syntactic pattern the transformer refuses to rewrite.
    #[error("unsupported construct in {path}: {message}")]
    Unsupported { path: PathBuf, message: String },

    /// A contract violation inside the core (arena index out of range,
    /// writer-lock misuse, double free of a cache id, ...).
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Two bundles resolved to the same output path.
    #[error("duplicate output: {output} is targeted by more than one entry")]
    Duplicated { output: PathBuf },

    /// A diagnostic produced by the external parser/transform engine.
    #[error("{}", .0.message)]
    Diagnostic(Diagnostic),

    /// I/O error with path context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file errors.
    #[error("config error at {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl BundlerError {
    pub fn module_not_found(specifier: impl Into<String>, from: impl Into<PathBuf>) -> Self {
        Self::ModuleNotFound {
            specifier: specifier.into(),
            from: from.into(),
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Unsupported {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn duplicated(output: impl Into<PathBuf>) -> Self {
        Self::Duplicated {
            output: output.into(),
        }
    }

    /// Error code matching the well-known diagnostic codes in the external
    /// interface section, where applicable.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::ModuleNotFound { .. } => Some(2307),
            Self::Internal { .. } => Some(20000),
            Self::Unsupported { .. } => Some(20001),
            Self::Diagnostic(d) => Some(d.code.as_u32()),
            Self::Duplicated { .. } => Some(20003),
            Self::Io { .. } | Self::Config { .. } => None,
        }
    }

    /// Per-module errors (`ModuleNotFound`, `Unsupported`, a wrapped parser
    /// diagnostic) mark a single module `errored` without aborting the
    /// bundle; everything else aborts the bundle that produced it.
    pub fn is_per_module(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound { .. } | Self::Unsupported { .. } | Self::Diagnostic(_)
        )
    }
}

/// Convenience alias for library results.
pub type BundlerResult<T> = Result<T, BundlerError>;

/// Extension trait for converting `std::io::Error` with path context.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> BundlerResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> BundlerResult<T> {
        self.map_err(|e| BundlerError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticCode;

    #[test]
    fn module_not_found_code_is_2307() {
        let err = BundlerError::module_not_found("./missing", "/src/a.ts");
        assert_eq!(err.code(), Some(2307));
        assert!(err.is_per_module());
    }

    #[test]
    fn internal_is_not_per_module() {
        let err = BundlerError::internal("writer lock poisoned");
        assert_eq!(err.code(), Some(20000));
        assert!(!err.is_per_module());
    }

    #[test]
    fn duplicated_code_is_20003() {
        let err = BundlerError::Duplicated {
            output: PathBuf::from("/out/bundle.js"),
        };
        assert_eq!(err.code(), Some(20003));
        assert!(!err.is_per_module());
    }

    #[test]
    fn diagnostic_wraps_code() {
        let diag = Diagnostic {
            source: PathBuf::from("/a.ts"),
            line: 1,
            column: 1,
            code: DiagnosticCode::JsError,
            message: "boom".into(),
            line_text: "let x =".into(),
            width: 7,
        };
        let err = BundlerError::Diagnostic(diag);
        assert_eq!(err.code(), Some(20002));
        assert!(err.is_per_module());
    }
}
