//! The module transformer: classifies and rewrites imports, and wraps each
//! module's refined body in the bundle's property-style wrapper, all in
//! terms of the `ParserEngine`/`ModuleResolver` trait outputs rather than a
//! real AST.

use std::path::Path;

use crate::config::{BundleConfig, ExportRule};
use crate::diagnostics::Diagnostic;
use crate::error::{BundlerError, BundlerResult};
use crate::module::{ExternalMode, ImportInfo, ImportTarget};
use crate::parser::{ImportKind, ParsedUnit, ParserEngine, RawImport};
use crate::resolver::{ModuleResolver, ResolveOutcome};

/// The reserved `varName` every bundle's entry module is allocated, rather
/// than one derived from its filename. Lets the entry be addressed from the
/// tail the same way any other module is addressed from a sibling.
pub const ENTRY_VAR_NAME: &str = "__entry";

/// A fully classified and resolved import, ready to be rewritten.
#[derive(Debug, Clone)]
pub struct ClassifiedImport {
    pub raw: RawImport,
    pub info: ImportInfo,
}

/// The result of transforming one module: its wrapped body plus the
/// classified imports the assembler needs to keep walking the graph.
#[derive(Debug, Clone)]
pub struct TransformedModule {
    pub wrapped_content: String,
    pub imports: Vec<ImportInfo>,
    pub declaration: Option<String>,
    pub global_declaration: Option<String>,
}

/// Implements the classification steps:
/// 1. parse via `ParserEngine`
/// 2. classify each raw import into one of the seven shapes
/// 3. resolve each non-declaration import via `ModuleResolver`
///
/// Wrapping (steps 4-7) lives on `ModuleWrapper`, which owns its
/// `BundleConfig` by value so it can move into a spawned task without
/// borrowing from this transformer.
pub struct ModuleTransformer<'a> {
    parser: &'a dyn ParserEngine,
    resolver: &'a dyn ModuleResolver,
    config: &'a BundleConfig,
}

impl<'a> ModuleTransformer<'a> {
    pub fn new(
        parser: &'a dyn ParserEngine,
        resolver: &'a dyn ModuleResolver,
        config: &'a BundleConfig,
    ) -> Self {
        Self {
            parser,
            resolver,
            config,
        }
    }

    /// Classifies and resolves every import the parser found in `apath`,
    /// without rewriting or wrapping. Used by the assembler to discover
    /// child modules before deciding whether to transform them.
    pub fn classify(&self, apath: &Path) -> Result<(ParsedUnit, Vec<ClassifiedImport>), Diagnostic> {
        let unit = self.parser.parse(apath, &self.config.compiler_options)?;
        let mut classified = Vec::with_capacity(unit.imports.len());

        for raw in &unit.imports {
            let is_declaration = raw.kind.is_declaration();
            let target = if self.config.is_external(&raw.specifier) {
                ImportTarget::External(ExternalMode::Manual)
            } else if self.config.preimport.iter().any(|p| p == &raw.specifier) {
                ImportTarget::External(ExternalMode::Preimport)
            } else {
                match self
                    .resolver
                    .resolve(&raw.specifier, apath, &self.config.compiler_options)
                {
                    ResolveOutcome::Resolved {
                        resolved_path,
                        is_external_library_import,
                    } => {
                        if is_external_library_import && !self.config.bundle_externals {
                            ImportTarget::External(ExternalMode::Manual)
                        } else {
                            ImportTarget::Local(resolved_path)
                        }
                    }
                    ResolveOutcome::External(mode) => ImportTarget::External(mode),
                    ResolveOutcome::NotFound => {
                        if raw.kind == ImportKind::DynamicImport
                            && self.config.suppress_dynamic_import_errors
                        {
                            ImportTarget::External(ExternalMode::Preimport)
                        } else {
                            return Err(Diagnostic::at_line(
                                apath,
                                0,
                                0,
                                "",
                                0,
                                crate::diagnostics::DiagnosticCode::ModuleNotFound,
                                format!("Cannot find module '{}'", raw.specifier),
                            ));
                        }
                    }
                }
            };

            classified.push(ClassifiedImport {
                raw: raw.clone(),
                info: ImportInfo {
                    target,
                    module_specifier: raw.specifier.clone(),
                    code_pos: Some(raw.code_pos),
                    is_declaration,
                },
            });
        }

        Ok((unit, classified))
    }
}

/// Strips the boilerplate a transpiler leaves at the edges of a module's
/// body: a leading shebang, a leading `"use strict";`, the two common
/// `__esModule` marker forms, and a trailing `//# sourceMappingURL=` line.
/// These are re-emitted by the wrapper itself (or dropped entirely), so
/// leaving them in the body would duplicate or misplace them.
fn strip_boilerplate(body: &str) -> String {
    let mut lines: Vec<&str> = body.lines().collect();
    let mut start = 0;
    if lines.first().map(|l| l.starts_with("#!")).unwrap_or(false) {
        start += 1;
    }
    while let Some(line) = lines.get(start) {
        let trimmed = line.trim();
        let is_boilerplate = trimmed == "\"use strict\";"
            || trimmed == "'use strict';"
            || trimmed.starts_with("Object.defineProperty(exports, \"__esModule\"")
            || trimmed.starts_with("Object.defineProperty(exports, '__esModule'")
            || trimmed == "exports.__esModule = true;";
        if is_boilerplate {
            start += 1;
        } else {
            break;
        }
    }
    let mut end = lines.len();
    if end > start && lines[end - 1].trim_start().starts_with("//# sourceMappingURL=") {
        end -= 1;
    }
    lines.truncate(end);
    lines[start..].join("\n") + if body.ends_with('\n') { "\n" } else { "" }
}

/// Wraps a module's classified imports and stripped body into the bundle's
/// property-style wrapper, and selects the entry module's top-level export
/// epilogue. Owns its `BundleConfig` by value so it can be moved into a
/// spawned refinement task.
pub struct ModuleWrapper {
    config: BundleConfig,
}

impl ModuleWrapper {
    pub fn new(config: BundleConfig) -> Self {
        Self { config }
    }

    /// Rewrites every non-declaration import reference in `body` to a
    /// property access on the global placeholder, keyed by each target
    /// module's assigned var name.
    fn rewrite_references(
        &self,
        body: &str,
        classified: &[ClassifiedImport],
        var_name_for: impl Fn(&ClassifiedImport) -> Option<String>,
    ) -> String {
        let mut out = body.to_string();
        for item in classified {
            if item.info.is_declaration {
                continue;
            }
            let Some(var_name) = var_name_for(item) else {
                continue;
            };
            let placeholder = format!("{}.{}", self.config.global_module_var_name, var_name);
            let quoted_single = format!("'{}'", item.raw.specifier);
            let quoted_double = format!("\"{}\"", item.raw.specifier);
            out = out.replace(&quoted_single, &placeholder);
            out = out.replace(&quoted_double, &placeholder);
        }
        out
    }

    /// Wraps a module's rewritten body as a property of the bundle object:
    /// a provenance comment, the `<varName>() {` opening, a short-circuit
    /// memo check keyed off `<G>.<varName>.exports`, the exports/module
    /// bindings, optional `__dirname`/`__filename` boilerplate, the
    /// stripped and rewritten body, and a tail returning whichever of
    /// `module.exports`/`exports` the body actually assigned. Used
    /// identically for the entry module (under the reserved var name
    /// `ENTRY_VAR_NAME`) and every other module.
    pub fn wrap(
        &self,
        var_name: &str,
        rpath: &str,
        unit: &ParsedUnit,
        classified: &[ClassifiedImport],
        var_name_for: impl Fn(&ClassifiedImport) -> Option<String>,
    ) -> TransformedModule {
        let stripped = strip_boilerplate(&unit.body);
        let rewritten_body = self.rewrite_references(&stripped, classified, var_name_for);
        let g = &self.config.global_module_var_name;

        let mut chunk = String::new();
        chunk.push_str(&format!("// {rpath}\n"));
        chunk.push_str(&format!("  {var_name}() {{\n"));
        chunk.push_str("    \"use strict\";\n");
        chunk.push_str(&format!(
            "    if ({g}.{var_name}.exports != null) return {g}.{var_name}.exports;\n"
        ));
        chunk.push_str("    var module = { exports: {} };\n");
        chunk.push_str("    var exports = module.exports;\n");
        if unit.uses_dirname {
            let dir = Path::new(rpath)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            chunk.push_str(&format!("    var __dirname = {dir:?};\n"));
        }
        if unit.uses_filename {
            chunk.push_str(&format!("    var __filename = {rpath:?};\n"));
        }
        chunk.push_str(&rewritten_body);
        if !rewritten_body.ends_with('\n') {
            chunk.push('\n');
        }
        chunk.push_str(&format!("    {g}.{var_name}.exports = module.exports;\n"));
        if unit.uses_module {
            chunk.push_str("    return module.exports;\n");
        } else {
            chunk.push_str("    return exports;\n");
        }
        chunk.push_str("  },\n");

        let imports = classified.iter().map(|c| c.info.clone()).collect();

        TransformedModule {
            wrapped_content: chunk,
            imports,
            declaration: unit.declaration.clone(),
            global_declaration: None,
        }
    }

    /// Builds the bundle's tail statement, invoking the entry property
    /// (`<G>.__entry()`) the way the configured `ExportRule` requires.
    /// `uses_module`/`uses_exports` come from the entry's own
    /// `RefinedModule`, which carries them through a cache hit as well as a
    /// fresh refinement.
    pub fn entry_tail(&self, uses_module: bool, uses_exports: bool) -> BundlerResult<String> {
        let g = &self.config.global_module_var_name;
        let entry_call = format!("{g}.{ENTRY_VAR_NAME}()");
        let export_name = self
            .config
            .export_var_name
            .clone()
            .unwrap_or_else(|| ENTRY_VAR_NAME.to_string());
        Ok(match self.config.module {
            ExportRule::None => String::new(),
            ExportRule::CommonJs => format!("module.exports = {entry_call};\n"),
            ExportRule::Es2015 => format!(
                "export default {entry_call};\nexport const {export_name} = {entry_call};\n"
            ),
            ExportRule::Var => format!("var {export_name} = {entry_call};\n"),
            ExportRule::Let => format!("let {export_name} = {entry_call};\n"),
            ExportRule::Const => format!("const {export_name} = {entry_call};\n"),
            ExportRule::This => format!("this.{export_name} = {entry_call};\n"),
            ExportRule::Window => format!("window.{export_name} = {entry_call};\n"),
            ExportRule::SelfObject => format!("self.{export_name} = {entry_call};\n"),
            ExportRule::Direct => {
                if !uses_module && !uses_exports {
                    return Err(BundlerError::unsupported(
                        Path::new("<entry>"),
                        "module: direct requires the entry module to assign module.exports or exports",
                    ));
                }
                format!("{entry_call};\n")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ImportKind;

    fn config() -> BundleConfig {
        BundleConfig::for_entry("src/main.ts".into(), "out/bundle.js".into()).unwrap()
    }

    fn unit_with_body(body: &str) -> ParsedUnit {
        ParsedUnit {
            imports: Vec::new(),
            body: body.to_string(),
            source_map: None,
            uses_dirname: false,
            uses_filename: false,
            uses_module: false,
            uses_exports: false,
            declaration: None,
        }
    }

    #[test]
    fn wraps_body_as_a_bundle_object_property() {
        let wrapper = ModuleWrapper::new(config());
        let unit = unit_with_body("exports.x = 1;");
        let result = wrapper.wrap("main", "src/main.ts", &unit, &[], |_| None);
        assert!(result.wrapped_content.contains("// src/main.ts\n"));
        assert!(result.wrapped_content.contains("main() {"));
        assert!(result
            .wrapped_content
            .contains("if (__tsb.main.exports != null) return __tsb.main.exports;"));
        assert!(result.wrapped_content.contains("exports.x = 1;"));
        assert!(result.wrapped_content.contains("__tsb.main.exports = module.exports;"));
        assert!(result.wrapped_content.contains("return exports;"));
        assert!(result.wrapped_content.trim_end().ends_with(','));
    }

    #[test]
    fn module_exports_assignment_is_returned_when_present() {
        let wrapper = ModuleWrapper::new(config());
        let unit = ParsedUnit {
            uses_module: true,
            ..unit_with_body("module.exports = { x: 1 };")
        };
        let result = wrapper.wrap("main", "src/main.ts", &unit, &[], |_| None);
        assert!(result.wrapped_content.contains("return module.exports;"));
        assert!(!result.wrapped_content.contains("return exports;"));
    }

    #[test]
    fn strips_leading_boilerplate_and_trailing_source_map_comment() {
        let wrapper = ModuleWrapper::new(config());
        let unit = unit_with_body(
            "\"use strict\";\nObject.defineProperty(exports, \"__esModule\", { value: true });\nexports.x = 1;\n//# sourceMappingURL=main.js.map\n",
        );
        let result = wrapper.wrap("main", "src/main.ts", &unit, &[], |_| None);
        assert!(!result.wrapped_content.contains("sourceMappingURL"));
        assert_eq!(result.wrapped_content.matches("use strict").count(), 1);
        assert!(result.wrapped_content.contains("exports.x = 1;"));
    }

    #[test]
    fn rewrites_specifier_to_global_placeholder() {
        let wrapper = ModuleWrapper::new(config());
        let unit = unit_with_body("import { x } from './utils';\nx();");
        let classified = vec![ClassifiedImport {
            raw: RawImport {
                specifier: "./utils".into(),
                kind: ImportKind::StaticImport,
                code_pos: 0,
            },
            info: ImportInfo {
                target: ImportTarget::Local("/src/utils.ts".into()),
                module_specifier: "./utils".into(),
                code_pos: Some(0),
                is_declaration: false,
            },
        }];
        let result = wrapper.wrap(
            "main",
            "src/main.ts",
            &unit,
            &classified,
            |item| match &item.info.target {
                ImportTarget::Local(p) if p.ends_with("utils.ts") => Some("utils".to_string()),
                _ => None,
            },
        );
        assert!(result.wrapped_content.contains("__tsb.utils"));
        assert!(!result.wrapped_content.contains("'./utils'"));
    }

    #[test]
    fn direct_export_rejects_entry_without_module_or_exports_usage() {
        let mut cfg = config();
        cfg.module = ExportRule::Direct;
        let wrapper = ModuleWrapper::new(cfg);
        assert!(wrapper.entry_tail(false, false).is_err());
        assert!(wrapper.entry_tail(true, false).is_ok());
    }

    #[test]
    fn commonjs_export_tail_invokes_the_entry_property() {
        let mut cfg = config();
        cfg.module = ExportRule::CommonJs;
        let wrapper = ModuleWrapper::new(cfg);
        let tail = wrapper.entry_tail(false, false).unwrap();
        assert_eq!(tail, "module.exports = __tsb.__entry();\n");
    }

    #[test]
    fn var_export_rule_defaults_to_the_reserved_entry_name() {
        let mut cfg = config();
        cfg.module = ExportRule::Var;
        let wrapper = ModuleWrapper::new(cfg);
        let tail = wrapper.entry_tail(false, false).unwrap();
        assert_eq!(tail, "var __entry = __tsb.__entry();\n");
    }

    #[test]
    fn host_object_export_rule_assigns_named_property() {
        let mut cfg = config();
        cfg.module = ExportRule::Window;
        cfg.export_var_name = Some("MyLib".to_string());
        let wrapper = ModuleWrapper::new(cfg);
        let tail = wrapper.entry_tail(false, false).unwrap();
        assert_eq!(tail, "window.MyLib = __tsb.__entry();\n");
    }
}
