//! Prelude module for convenient imports.
//!
//! Import commonly used types with a single line:
//!
//! ```rust,ignore
//! use bundler_core::prelude::*;
//! ```

// Error handling
pub use crate::error::{BundlerError, BundlerResult};

// Data model
pub use crate::module::{BundlerModule, ExternalMode, ImportInfo, ImportTarget, ModuleId, ScriptKind};

// Configuration
pub use crate::config::{BundleConfig, ExportRule, RawBundleConfig};

// External collaborator seams
pub use crate::parser::{ParserEngine, StaticImportParserEngine};
pub use crate::resolver::{ModuleResolver, NodeModuleResolver, ResolveOutcome};

// Assembly
pub use crate::assembler::{BundleAssembler, BundleOutput, WatchHandle};

// Registry
pub use crate::registry::Registry;

// Diagnostics
pub use crate::diagnostics::{Diagnostic, DiagnosticCode};

// Logging
pub use crate::logging::{init_structured_logging, log_error, log_info, log_warn};
