//! `ModuleResolver`: the external collaborator seam wrapping Node-style
//! module resolution. Mirrors the `nodeModuleNameResolver`
//! contract shape; this crate ships a real (not stubbed) relative/extension
//! probing resolver good enough to resolve its own test fixtures.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::module::ExternalMode;

/// Extensions probed, in priority order, when a specifier names a file
/// without an extension.
const PROBE_EXTENSIONS: &[&str] = &["ts", "tsx", "d.ts", "js", "jsx", "mjs", "cjs"];

/// Where a specifier resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Resolved to a local file.
    Resolved {
        resolved_path: PathBuf,
        is_external_library_import: bool,
    },
    /// Matched one of the user's configured external modes.
    External(ExternalMode),
    /// Could not be resolved to anything.
    NotFound,
}

/// Wraps Node-style module resolution. The real Node resolution algorithm
/// is out of scope to reimplement in full; this crate only consumes its
/// output shape.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, specifier: &str, containing: &Path, options: &Value) -> ResolveOutcome;
}

/// A real relative/extension-probing resolver: `./x` is tried as `x.ts`,
/// `x.tsx`, `x.d.ts`, `x.js`, `x/index.ts`, and so on; anything reached
/// through a `node_modules` path segment is flagged as an external-library
/// import, matching the `isExternalLibraryImport` contract field.
#[derive(Debug, Default)]
pub struct NodeModuleResolver;

impl NodeModuleResolver {
    pub fn new() -> Self {
        Self
    }

    fn probe(base: &Path) -> Option<PathBuf> {
        if base.is_file() {
            return Some(base.to_path_buf());
        }
        for ext in PROBE_EXTENSIONS {
            let candidate = base.with_extension(ext);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        for ext in PROBE_EXTENSIONS {
            let candidate = base.join(format!("index.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

impl ModuleResolver for NodeModuleResolver {
    fn resolve(&self, specifier: &str, containing: &Path, _options: &Value) -> ResolveOutcome {
        let is_relative = specifier.starts_with('.');
        let containing_dir = containing.parent().unwrap_or_else(|| Path::new("."));

        if is_relative {
            let base = containing_dir.join(specifier);
            return match Self::probe(&base) {
                Some(resolved_path) => ResolveOutcome::Resolved {
                    resolved_path,
                    is_external_library_import: false,
                },
                None => ResolveOutcome::NotFound,
            };
        }

        // Non-relative: probe node_modules upward from the containing
        // directory, matching Node's resolution algorithm in spirit.
        let mut dir = containing_dir.to_path_buf();
        loop {
            let candidate_root = dir.join("node_modules").join(specifier);
            if let Some(resolved_path) = Self::probe(&candidate_root) {
                return ResolveOutcome::Resolved {
                    resolved_path,
                    is_external_library_import: true,
                };
            }
            if !dir.pop() {
                break;
            }
        }
        ResolveOutcome::NotFound
    }
}
