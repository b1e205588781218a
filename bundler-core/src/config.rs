//! Bundle configuration: the closed set of options accepted from a config
//! file or built programmatically via the fluent builder.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use crate::error::{BundlerError, BundlerResult};

/// How a module's exports are emitted at the top of the bundle (the
/// `module` config key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportRule {
    /// Nothing is exported; the entry module's exports are discarded.
    None,
    /// `module.exports = ...` (CommonJS).
    CommonJs,
    /// `export { ... }` (ES2015).
    Es2015,
    /// `var NAME = ...` at top level (`NAME` from `exportVarName`, defaulting
    /// to the entry module's own var name).
    Var,
    /// `let NAME = ...`, same naming rule as `Var`.
    Let,
    /// `const NAME = ...`, same naming rule as `Var`.
    Const,
    /// `this.NAME = ...` (UMD-style host-object assignment).
    This,
    /// `window.NAME = ...`.
    Window,
    /// `self.NAME = ...` (workers).
    SelfObject,
    /// Exports are returned directly as the wrapper function's value.
    Direct,
}

impl Default for ExportRule {
    fn default() -> Self {
        ExportRule::None
    }
}

fn default_global_module_var_name() -> String {
    "__tsb".to_string()
}

fn default_cache_memory() -> String {
    "1G".to_string()
}

/// Raw, deserializable configuration shape, matching a `bundle.toml` file
/// field-for-field. All fields but `entry` are optional so unspecified keys
/// fall back to documented defaults.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBundleConfig {
    pub entry: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub module: ExportRule,
    #[serde(default = "default_global_module_var_name")]
    pub global_module_var_name: String,
    pub clear_console: Option<bool>,
    pub watch_waiting: Option<u64>,
    pub verbose: Option<bool>,
    pub check_circular_dependency: Option<bool>,
    pub suppress_dynamic_import_errors: Option<bool>,
    pub faster: Option<bool>,
    pub bundle_externals: Option<bool>,
    #[serde(default)]
    pub externals: Vec<String>,
    #[serde(default)]
    pub preimport: Vec<String>,
    #[serde(default = "default_cache_memory")]
    pub cache_memory: String,
    pub export_lib: Option<String>,
    /// The `NAME` used by `module: var|let|const|this|window|self`. Falls
    /// back to the entry module's own disambiguated var name when unset.
    pub export_var_name: Option<String>,
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub compiler_options: serde_json::Value,
}

/// Resolved bundle configuration, ready for use by the assembler.
///
/// Unlike `RawBundleConfig`, every field here carries its default already
/// applied, and `externals` has been compiled into a `GlobSet`.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub entry: Vec<PathBuf>,
    pub output: PathBuf,
    pub module: ExportRule,
    pub global_module_var_name: String,
    pub clear_console: bool,
    pub watch_waiting: u64,
    pub verbose: bool,
    pub check_circular_dependency: bool,
    pub suppress_dynamic_import_errors: bool,
    pub faster: bool,
    pub bundle_externals: bool,
    pub externals: GlobSet,
    pub preimport: Vec<String>,
    /// Cache memory budget in bytes, parsed from the `"1G"`/`"512M"`-style suffix.
    pub cache_memory_bytes: u64,
    pub export_lib: Option<String>,
    pub export_var_name: Option<String>,
    pub concurrency: usize,
    pub compiler_options: serde_json::Value,
    /// Mtime of the config file this bundle was resolved from, used to
    /// invalidate the refinement cache on a config change. `UNIX_EPOCH`
    /// for programmatic configs with no backing file.
    pub config_mtime: SystemTime,
}

/// Parses a `"512M"`/`"1G"`/`"2048K"`-style memory suffix into bytes.
/// A bare number (no suffix) is interpreted as bytes.
fn parse_memory_suffix(raw: &str) -> BundlerResult<u64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('G') | Some('g') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        Some('M') | Some('m') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('K') | Some('k') => (&raw[..raw.len() - 1], 1024),
        _ => (raw, 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| BundlerError::config(PathBuf::new(), format!("invalid cacheMemory: {raw}")))?;
    Ok(n * multiplier)
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(8)
}

impl BundleConfig {
    /// Resolves a `RawBundleConfig`, applying defaults and compiling globs.
    /// Mirrors the distilled spec's `exportLib` + `module: var`
    /// override-and-warn rule: when both are set, `global_module_var_name`
    /// is replaced by the export-lib name and a warning is logged.
    pub fn from_raw(raw: RawBundleConfig, config_path: &Path) -> BundlerResult<Self> {
        let mut global_module_var_name = raw.global_module_var_name;
        if let Some(export_lib) = &raw.export_lib {
            if raw.module == ExportRule::Var {
                tracing::warn!(
                    export_lib = %export_lib,
                    previous = %global_module_var_name,
                    "exportLib overrides globalModuleVarName for module: var"
                );
                global_module_var_name = export_lib.clone();
            }
        }

        let mut externals_builder = GlobSetBuilder::new();
        for pattern in &raw.externals {
            let glob = Glob::new(pattern).map_err(|e| {
                BundlerError::config(config_path, format!("invalid externals glob '{pattern}': {e}"))
            })?;
            externals_builder.add(glob);
        }
        let externals = externals_builder
            .build()
            .map_err(|e| BundlerError::config(config_path, format!("invalid externals set: {e}")))?;

        let output = raw.output.unwrap_or_else(|| PathBuf::from("bundle.js"));
        let cache_memory_bytes = parse_memory_suffix(&raw.cache_memory)?;
        let config_mtime = std::fs::metadata(config_path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(Self {
            entry: raw.entry,
            output,
            module: raw.module,
            global_module_var_name,
            clear_console: raw.clear_console.unwrap_or(false),
            watch_waiting: raw.watch_waiting.unwrap_or(100),
            verbose: raw.verbose.unwrap_or(false),
            check_circular_dependency: raw.check_circular_dependency.unwrap_or(true),
            suppress_dynamic_import_errors: raw.suppress_dynamic_import_errors.unwrap_or(false),
            faster: raw.faster.unwrap_or(false),
            bundle_externals: raw.bundle_externals.unwrap_or(false),
            externals,
            preimport: raw.preimport,
            cache_memory_bytes,
            export_lib: raw.export_lib,
            export_var_name: raw.export_var_name,
            concurrency: raw.concurrency.unwrap_or_else(default_concurrency),
            compiler_options: raw.compiler_options,
            config_mtime,
        })
    }

    /// Loads and resolves configuration from a TOML file.
    pub fn load(path: &Path) -> BundlerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BundlerError::io(path.to_path_buf(), e))?;
        let raw: RawBundleConfig = toml::from_str(&content)
            .map_err(|e| BundlerError::config(path.to_path_buf(), e.to_string()))?;
        Self::from_raw(raw, path)
    }

    /// A minimal programmatic configuration for a single entry point,
    /// useful for tests and library embedders that don't use a config file.
    pub fn for_entry(entry: PathBuf, output: PathBuf) -> BundlerResult<Self> {
        Self::from_raw(
            RawBundleConfig {
                entry: vec![entry],
                output: Some(output),
                module: ExportRule::default(),
                global_module_var_name: default_global_module_var_name(),
                clear_console: None,
                watch_waiting: None,
                verbose: None,
                check_circular_dependency: None,
                suppress_dynamic_import_errors: None,
                faster: None,
                bundle_externals: None,
                externals: Vec::new(),
                preimport: Vec::new(),
                cache_memory: default_cache_memory(),
                export_lib: None,
                export_var_name: None,
                concurrency: None,
                compiler_options: serde_json::Value::Null,
            },
            Path::new("<programmatic>"),
        )
    }

    pub fn is_external(&self, specifier: &str) -> bool {
        self.externals.is_match(specifier)
    }
}
