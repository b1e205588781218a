//! Diagnostic values produced by the external parser/transform engine.
//!
//! Modelled after an existing compiler's diagnostic shape. Rendering a
//! `Diagnostic` to a terminal (carets, color, source snippets) is out of
//! scope for this crate; only the structured value is in scope.

use std::path::{Path, PathBuf};

/// Well-known diagnostic codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiagnosticCode {
    ModuleNotFound,
    InternalError,
    Unsupported,
    JsError,
    Duplicated,
}

impl DiagnosticCode {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::ModuleNotFound => 2307,
            Self::InternalError => 20000,
            Self::Unsupported => 20001,
            Self::JsError => 20002,
            Self::Duplicated => 20003,
        }
    }
}

/// A single diagnostic: source location, well-known code, and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub source: PathBuf,
    pub line: u32,
    pub column: u32,
    pub code: DiagnosticCode,
    pub message: String,
    pub line_text: String,
    pub width: u32,
}

impl Diagnostic {
    pub fn js_error(source: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            line: 0,
            column: 0,
            code: DiagnosticCode::JsError,
            message: message.into(),
            line_text: String::new(),
            width: 0,
        }
    }

    pub fn at_line(
        source: &Path,
        line: u32,
        column: u32,
        line_text: impl Into<String>,
        width: u32,
        code: DiagnosticCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.to_path_buf(),
            line,
            column,
            code,
            message: message.into(),
            line_text: line_text.into(),
            width,
        }
    }
}
