//! `ParserEngine`: the external collaborator seam wrapping the real JS/TS
//! parser/transform engine. This crate defines the trait and
//! ships a dependency-free literal-pattern engine good enough to drive its
//! own test suite; a real deployment swaps in an `oxc`/`swc`-backed engine
//! behind the same trait (see DESIGN.md).

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::diagnostics::Diagnostic;

fn specifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("static regex"))
}

/// Matches the declaration-only constructs this engine can recognise without
/// a real AST: `declare global`/`declare module '...'`, `namespace X`, and
/// top-level type aliases. These carry no runtime body and are collected
/// into `ParsedUnit::declaration` rather than the module's wrapped body.
fn declaration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(export\s+)?(declare\s+(global\b|module\s+['"][^'"]+['"])|namespace\s+\w|type\s+\w+\s*=)"#)
            .expect("static regex")
    })
}

/// One import/re-export/require statement recognised in a module's source,
/// before resolution. Target is still a raw specifier string at this
/// stage; `resolver::ModuleResolver` turns it into a `ImportTarget`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImport {
    pub specifier: String,
    pub kind: ImportKind,
    pub code_pos: usize,
}

/// The seven import shapes a module's imports can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x from '...'` / `import { x } from '...'`.
    StaticImport,
    /// `export { x } from '...'` / `export * from '...'`.
    ReExport,
    /// `require('...')`.
    RequireCall,
    /// `import('...')`.
    DynamicImport,
    /// `import x = require('...')`.
    ImportEquals,
    /// `import type { x } from '...'`.
    ImportType,
    /// `declare module '...'`.
    ExternalModuleDeclaration,
}

impl ImportKind {
    /// Declaration-only import shapes carry no runtime dependency and are
    /// recorded as `ImportInfo::is_declaration = true`.
    pub fn is_declaration(self) -> bool {
        matches!(self, ImportKind::ImportType | ImportKind::ExternalModuleDeclaration)
    }
}

/// The output of parsing one module: its raw imports, its body, and the
/// flags the transformer needs to decide how to wrap it.
#[derive(Debug, Clone, Default)]
pub struct ParsedUnit {
    pub imports: Vec<RawImport>,
    pub body: String,
    pub source_map: Option<String>,
    pub uses_dirname: bool,
    pub uses_filename: bool,
    pub uses_module: bool,
    pub uses_exports: bool,
    pub declaration: Option<String>,
}

/// Wraps the real front-end parser/transform engine (AST construction,
/// per-file transform, per-file raw source map, declaration emission). Out
/// of scope to implement fully here; this crate only consumes its output
/// shape.
pub trait ParserEngine: Send + Sync {
    fn parse(&self, apath: &Path, options: &Value) -> Result<ParsedUnit, Diagnostic>;
}

/// A dependency-free engine recognising the literal import forms the
/// bundler's own tests exercise via plain line/regex scanning. Does not
/// build a real AST and will misparse anything beyond the literal forms it
/// knows (string-literal specifiers on their own statement). Documented in
/// DESIGN.md as the stand-in for a real `oxc`/`swc`-backed engine.
#[derive(Debug, Default)]
pub struct StaticImportParserEngine;

impl StaticImportParserEngine {
    pub fn new() -> Self {
        Self
    }

    fn extract_specifier(line: &str) -> Option<&str> {
        specifier_re()
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    fn classify_line(trimmed: &str) -> Option<ImportKind> {
        if trimmed.starts_with("import type ") {
            Some(ImportKind::ImportType)
        } else if trimmed.contains("import") && trimmed.contains("= require(") {
            Some(ImportKind::ImportEquals)
        } else if trimmed.starts_with("import(") || trimmed.contains(" import(") {
            Some(ImportKind::DynamicImport)
        } else if trimmed.starts_with("export") && trimmed.contains(" from ") {
            Some(ImportKind::ReExport)
        } else if trimmed.starts_with("export *") && trimmed.contains(" from ") {
            Some(ImportKind::ReExport)
        } else if trimmed.starts_with("import ") && trimmed.contains(" from ") {
            Some(ImportKind::StaticImport)
        } else if trimmed.starts_with("declare module ") {
            Some(ImportKind::ExternalModuleDeclaration)
        } else if trimmed.contains("require(") {
            Some(ImportKind::RequireCall)
        } else {
            None
        }
    }
}

impl ParserEngine for StaticImportParserEngine {
    fn parse(&self, apath: &Path, _options: &Value) -> Result<ParsedUnit, Diagnostic> {
        let source = std::fs::read_to_string(apath)
            .map_err(|e| Diagnostic::js_error(apath, format!("failed to read source: {e}")))?;

        let mut imports = Vec::new();
        let mut code_pos = 0usize;
        let mut uses_dirname = false;
        let mut uses_filename = false;
        let mut uses_module = false;
        let mut uses_exports = false;
        let mut declaration = String::new();

        for line in source.lines() {
            let trimmed = line.trim_start();
            if let Some(kind) = Self::classify_line(trimmed) {
                if let Some(specifier) = Self::extract_specifier(trimmed) {
                    imports.push(RawImport {
                        specifier: specifier.to_string(),
                        kind,
                        code_pos,
                    });
                }
            } else if declaration_re().is_match(trimmed) {
                declaration.push_str(trimmed);
                declaration.push('\n');
            }
            if trimmed.contains("__dirname") {
                uses_dirname = true;
            }
            if trimmed.contains("__filename") {
                uses_filename = true;
            }
            if trimmed.contains("module.exports") || trimmed.contains("module.") {
                uses_module = true;
            }
            if trimmed.contains("exports.") {
                uses_exports = true;
            }
            code_pos += line.len() + 1;
        }

        Ok(ParsedUnit {
            imports,
            body: source,
            source_map: None,
            uses_dirname,
            uses_filename,
            uses_module,
            uses_exports,
            declaration: if declaration.is_empty() {
                None
            } else {
                Some(declaration)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("bundler-core-parser-test-{}-{n}.ts", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn recognises_static_import() {
        let path = write_temp("import { foo } from './foo';\nfoo();\n");
        let engine = StaticImportParserEngine::new();
        let unit = engine.parse(&path, &Value::Null).unwrap();
        assert_eq!(unit.imports.len(), 1);
        assert_eq!(unit.imports[0].specifier, "./foo");
        assert_eq!(unit.imports[0].kind, ImportKind::StaticImport);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn recognises_dynamic_import_and_require() {
        let path = write_temp("const x = require('./bar');\nimport('./baz');\n");
        let engine = StaticImportParserEngine::new();
        let unit = engine.parse(&path, &Value::Null).unwrap();
        assert_eq!(unit.imports.len(), 2);
        assert_eq!(unit.imports[0].kind, ImportKind::RequireCall);
        assert_eq!(unit.imports[1].kind, ImportKind::DynamicImport);
    }

    #[test]
    fn recognises_import_type_as_declaration() {
        let path = write_temp("import type { Foo } from './types';\n");
        let engine = StaticImportParserEngine::new();
        let unit = engine.parse(&path, &Value::Null).unwrap();
        assert_eq!(unit.imports[0].kind, ImportKind::ImportType);
        assert!(unit.imports[0].kind.is_declaration());
    }

    #[test]
    fn collects_ambient_declarations_separately_from_runtime_imports() {
        let path = write_temp(
            "declare global {\n  interface Window {}\n}\nnamespace Foo {\n  export const x = 1;\n}\ntype Bar = string;\nimport { a } from './a';\n",
        );
        let engine = StaticImportParserEngine::new();
        let unit = engine.parse(&path, &Value::Null).unwrap();
        assert_eq!(unit.imports.len(), 1);
        let declaration = unit.declaration.expect("declaration lines collected");
        assert!(declaration.contains("declare global"));
        assert!(declaration.contains("namespace Foo"));
        assert!(declaration.contains("type Bar ="));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn detects_module_and_dirname_usage() {
        let path = write_temp("console.log(__dirname);\nmodule.exports = {};\n");
        let engine = StaticImportParserEngine::new();
        let unit = engine.parse(&path, &Value::Null).unwrap();
        assert!(unit.uses_dirname);
        assert!(unit.uses_module);
    }
}
