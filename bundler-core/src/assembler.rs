//! The bundle assembly pipeline: bounded-concurrency module walk,
//! totally-ordered output write, cache-backed refinement, and the
//! watch-mode re-entry contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, OnceCell};

use crate::cache::{RefinedModule, RefinementCache};
use crate::concurrency::ConcurrencyQueue;
use crate::config::BundleConfig;
use crate::cycle::detect_cycles;
use crate::diagnostics::Diagnostic;
use crate::error::{BundlerError, BundlerResult, IoResultExt};
use crate::module::{BundlerModule, ExternalMode, ImportInfo, ImportTarget, ModuleId, ScriptKind};
use crate::parser::{ParsedUnit, ParserEngine};
use crate::registry::Registry;
use crate::resolver::ModuleResolver;
use crate::stitcher::SourceMapStitcher;
use crate::transform::{ClassifiedImport, ModuleTransformer, ModuleWrapper, ENTRY_VAR_NAME};

/// Process-wide source of distinct `BundleAssembler` identities, used to
/// tell "the same assembler re-bundling its own output" (always allowed)
/// apart from "two different assemblers targeting the same output"
/// (rejected as `BundlerError::Duplicated`).
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Output of one successful `bundle()` call.
#[derive(Debug, Clone)]
pub struct BundleOutput {
    pub output_path: PathBuf,
    pub source_map_path: Option<PathBuf>,
    pub declaration_path: Option<PathBuf>,
    pub module_count: usize,
    pub error_count: usize,
}

/// Lazily-opened output writer, guarded by a mutex so every append is
/// totally ordered regardless of which module finished refining first.
struct Writer {
    file: OnceCell<tokio::fs::File>,
    path: PathBuf,
}

impl Writer {
    fn new(path: PathBuf) -> Self {
        Self {
            file: OnceCell::new(),
            path: path.clone(),
        }
    }

    async fn file(&self) -> BundlerResult<&tokio::fs::File> {
        self.file
            .get_or_try_init(|| async {
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_path(parent.to_path_buf())?;
                }
                tokio::fs::File::create(&self.path)
                    .await
                    .with_path(self.path.clone())
            })
            .await
    }

    async fn append(&self, bytes: &[u8]) -> BundlerResult<()> {
        use tokio::io::AsyncWriteExt;
        let file = self.file().await?;
        let mut file = file.try_clone().await.with_path(self.path.clone())?;
        file.write_all(bytes).await.with_path(self.path.clone())
    }
}

/// A handle an external watch loop (out of scope here) can use to
/// discover the bundle's current file dependencies and trigger a rebuild.
/// This crate does not poll the filesystem itself.
pub struct WatchHandle {
    dependencies: Arc<Mutex<Vec<PathBuf>>>,
}

impl WatchHandle {
    pub async fn dependency_list(&self) -> Vec<PathBuf> {
        self.dependencies.lock().await.clone()
    }
}

/// What the graph walk decided about one local module, carried from
/// `walk_module` into the refinement stage so a cache hit never re-enters
/// the transform engine.
enum NodeWork {
    /// A valid cached refinement was found; nothing left to do but emit it.
    CacheHit(RefinedModule),
    /// No valid cache entry; the module was classified during the walk and
    /// still needs to be wrapped.
    Pending {
        unit: ParsedUnit,
        classified: Vec<ClassifiedImport>,
        source_mtime: SystemTime,
        declaration_mtime: Option<SystemTime>,
    },
    /// Classification itself failed; the module is emitted as a throwing
    /// placeholder and contributes no children to the graph.
    Errored(Diagnostic),
}

/// The mtime of `<source-without-ext>.d.ts`, if a declaration side-file
/// exists next to the source. `None` rather than `UNIX_EPOCH` when absent,
/// so a module gaining or losing its declaration file also invalidates the
/// cache (a `None` never compares equal to a `Some`).
fn declaration_mtime_for(apath: &Path) -> Option<SystemTime> {
    let decl_path = apath.with_extension("d.ts");
    std::fs::metadata(&decl_path).and_then(|m| m.modified()).ok()
}

/// The synthetic "path" a preimport external is keyed by in the graph,
/// distinct from any real source file so it can share `by_apath`/
/// `path_to_varname` bookkeeping with local modules without colliding.
fn external_synthetic_path(mode: ExternalMode, specifier: &str) -> PathBuf {
    match mode {
        ExternalMode::Manual => PathBuf::from(format!("<manual:{specifier}>")),
        ExternalMode::Preimport => PathBuf::from(format!("<preimport:{specifier}>")),
    }
}

/// Implements the 11-step bundle algorithm: resolve entries, walk the
/// import graph with bounded concurrency, refine each module (cache hit or
/// transform), write each module's chunk to the output in prelude / child
/// chunks / preimport properties / entry chunk / tail order, stitch source
/// maps, emit a declaration artifact, and report aggregated per-bundle
/// error counts.
pub struct BundleAssembler {
    config: BundleConfig,
    registry: Arc<Registry>,
    cache: Arc<RefinementCache>,
    parser: Arc<dyn ParserEngine>,
    resolver: Arc<dyn ModuleResolver>,
    busy: AtomicBool,
    error_count: AtomicUsize,
    dependencies: Arc<Mutex<Vec<PathBuf>>>,
    instance_id: u64,
}

impl BundleAssembler {
    pub async fn new(
        config: BundleConfig,
        cache_dir: PathBuf,
        parser: Box<dyn ParserEngine>,
        resolver: Box<dyn ModuleResolver>,
    ) -> Self {
        let registry = Registry::get_instance(&cache_dir).await;
        let cache = Arc::new(RefinementCache::new(cache_dir, config.cache_memory_bytes));
        Self {
            config,
            registry,
            cache,
            parser: Arc::from(parser),
            resolver: Arc::from(resolver),
            busy: AtomicBool::new(false),
            error_count: AtomicUsize::new(0),
            dependencies: Arc::new(Mutex::new(Vec::new())),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn watch_handle(&self) -> WatchHandle {
        WatchHandle {
            dependencies: self.dependencies.clone(),
        }
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Acquire)
    }

    /// Flushes the id registry's cache map synchronously. `Drop` can't run
    /// async code, so callers that need a guaranteed flush on exit (the CLI's
    /// `main`, regardless of whether `bundle()` succeeded) call this directly
    /// rather than relying on a destructor.
    pub fn save_cache_sync(&self) -> BundlerResult<()> {
        self.registry.save_cache_json_sync()
    }

    /// Runs the bundle. Rejects re-entrant calls while a previous call on
    /// this assembler is still running (the watch-mode busy-flag contract),
    /// rather than queueing or interleaving two runs.
    pub async fn bundle(&self) -> BundlerResult<BundleOutput> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BundlerError::internal("bundler is busy"));
        }
        if let Err(e) = self
            .registry
            .claim_output(&self.config.output, self.instance_id)
            .await
        {
            self.busy.store(false, Ordering::Release);
            return Err(e);
        }

        let result = self.bundle_inner().await;
        self.busy.store(false, Ordering::Release);

        match &result {
            Ok(output) => {
                let still_present: Vec<PathBuf> = {
                    let deps = self.dependencies.lock().await;
                    deps.clone()
                };
                self.registry
                    .sweep_removed_modules(&self.config.output, &still_present)
                    .await;
                let _ = output;
                self.registry.save_cache_json().await?;
            }
            Err(_) => {
                // preserve-on-failure: no forced prune here, entries
                // simply age out on the normal 24h schedule.
            }
        }
        result
    }

    async fn bundle_inner(&self) -> BundlerResult<BundleOutput> {
        self.error_count.store(0, Ordering::Release);
        let queue = Arc::new(ConcurrencyQueue::new(self.config.concurrency));

        let mut nodes: Vec<BundlerModule> = Vec::new();
        let mut by_apath: HashMap<PathBuf, u32> = HashMap::new();
        let mut dependencies = Vec::new();
        let mut entry_indices = Vec::new();
        let mut node_work: Vec<Option<NodeWork>> = Vec::new();

        for (i, entry) in self.config.entry.iter().enumerate() {
            let entry = entry.canonicalize().unwrap_or_else(|_| entry.clone());
            let index = self
                .walk_module(
                    &entry,
                    i == 0,
                    &mut nodes,
                    &mut by_apath,
                    &mut dependencies,
                    &mut node_work,
                    &queue,
                )
                .await?;
            entry_indices.push(index);
        }

        {
            let mut deps = self.dependencies.lock().await;
            *deps = dependencies;
        }

        if self.config.check_circular_dependency {
            let cycles = detect_cycles(&nodes, &entry_indices);
            for cycle in &cycles {
                let names: Vec<String> = cycle
                    .path
                    .iter()
                    .map(|&i| nodes[i as usize].mpath.clone())
                    .collect();
                tracing::warn!(cycle = %names.join(" -> "), "circular dependency detected");
            }
        }

        // `export: es2015` emits top-level `export` statements, which are a
        // syntax error inside a function body — those builds skip the IIFE
        // wrapper entirely and rely on the host's module scope instead.
        let wrap_in_iife = self.config.module != crate::config::ExportRule::Es2015;

        let writer = Writer::new(self.config.output.clone());
        let g = self.config.global_module_var_name.clone();
        let mut prelude = String::new();
        if wrap_in_iife {
            prelude.push_str("(function() {\n");
        }
        prelude.push_str("  \"use strict\";\n");
        prelude.push_str(&format!("  var {g} = {{\n"));
        writer.append(prelude.as_bytes()).await?;

        let output_file_name = self
            .config
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle.js".to_string());
        let mut stitcher = SourceMapStitcher::new(&output_file_name);
        let mut line_offset: u32 = prelude.matches('\n').count() as u32;

        let path_to_varname: Arc<HashMap<PathBuf, String>> = Arc::new(
            nodes
                .iter()
                .map(|n| (n.id.apath.clone(), n.id.var_name.clone()))
                .collect(),
        );

        let mut refined_by_index: Vec<Option<Result<RefinedModule, Diagnostic>>> =
            (0..nodes.len()).map(|_| None).collect();

        let mut join_set = tokio::task::JoinSet::new();
        for (index, node) in nodes.iter().enumerate() {
            if node.id.is_external() {
                continue;
            }
            match node_work[index].take() {
                Some(NodeWork::CacheHit(refined)) => {
                    refined_by_index[index] = Some(Ok(refined));
                }
                Some(NodeWork::Errored(diag)) => {
                    refined_by_index[index] = Some(Err(diag));
                }
                Some(NodeWork::Pending {
                    unit,
                    classified,
                    source_mtime,
                    declaration_mtime,
                }) => {
                    let cache = self.cache.clone();
                    let config = self.config.clone();
                    let queue = queue.clone();
                    let path_to_varname = path_to_varname.clone();
                    let module_number = node.id.number;
                    let var_name = node.id.var_name.clone();
                    let rpath = node.rpath.clone();

                    join_set.spawn(async move {
                        let refined = queue
                            .run(finish_refinement(
                                cache,
                                config,
                                module_number,
                                var_name,
                                rpath,
                                unit,
                                classified,
                                source_mtime,
                                declaration_mtime,
                                path_to_varname,
                            ))
                            .await;
                        (index, refined)
                    });
                }
                None => {
                    refined_by_index[index] = Some(Err(Diagnostic::js_error(
                        &node.id.apath,
                        "module was not visited during the graph walk",
                    )));
                }
            }
        }

        while let Some(outcome) = join_set.join_next().await {
            let (index, refined) = outcome.map_err(|e| {
                BundlerError::internal(format!("refine task panicked: {e}"))
            })?;
            refined_by_index[index] = Some(refined);
        }

        let mut declaration_text = String::new();
        let mut entry_refined: Option<RefinedModule> = None;

        // Child chunks first, any order.
        for (index, node) in nodes.iter().enumerate() {
            if node.id.is_external() || node.is_entry {
                continue;
            }
            let refined = refined_by_index[index]
                .take()
                .expect("every local node has a refinement outcome")
                .unwrap_or_else(|diag| {
                    self.error_count.fetch_add(1, Ordering::AcqRel);
                    tracing::error!(apath = %node.id.apath.display(), message = %diag.message, "module errored, emitting throwing placeholder");
                    errored_placeholder(node, &diag)
                });

            writer.append(refined.content.as_bytes()).await?;
            if let Some(raw_map) = &refined.source_map_text {
                let _ = stitcher.append(&node.id.apath, raw_map, line_offset);
            }
            line_offset += refined.output_line_count + refined.source_map_output_line_offset;
            if let Some(decl) = &refined.declaration {
                declaration_text.push_str(&format!(
                    "declare namespace {} {{\n{decl}}}\n",
                    node.id.var_name
                ));
            }
        }

        // Preimport properties, after every child chunk.
        for node in nodes.iter() {
            if node.id.external_mode() == Some(ExternalMode::Preimport) {
                let line = format!("  {}: require({:?}),\n", node.id.var_name, node.rpath);
                writer.append(line.as_bytes()).await?;
                line_offset += 1;
            }
        }

        // Entry chunk, last property before the bundle object closes.
        for (index, node) in nodes.iter().enumerate() {
            if !node.is_entry {
                continue;
            }
            let refined = refined_by_index[index]
                .take()
                .expect("every local node has a refinement outcome")
                .unwrap_or_else(|diag| {
                    self.error_count.fetch_add(1, Ordering::AcqRel);
                    tracing::error!(apath = %node.id.apath.display(), message = %diag.message, "module errored, emitting throwing placeholder");
                    errored_placeholder(node, &diag)
                });

            writer.append(refined.content.as_bytes()).await?;
            if let Some(raw_map) = &refined.source_map_text {
                let _ = stitcher.append(&node.id.apath, raw_map, line_offset);
            }
            line_offset += refined.output_line_count + refined.source_map_output_line_offset;
            if let Some(decl) = &refined.declaration {
                declaration_text.push_str(&format!(
                    "declare namespace {} {{\n{decl}}}\n",
                    node.id.var_name
                ));
            }
            entry_refined = Some(refined);
        }

        writer.append(b"  };\n").await?;

        let wrapper = ModuleWrapper::new(self.config.clone());
        let (uses_module, uses_exports) = entry_refined
            .as_ref()
            .map(|r| (r.uses_module, r.uses_exports))
            .unwrap_or((false, false));
        let tail = wrapper.entry_tail(uses_module, uses_exports)?;
        writer.append(tail.as_bytes()).await?;

        if wrap_in_iife {
            writer.append(b"})();\n").await?;
        }

        let source_map_path = if nodes.iter().any(|n| !n.id.is_external()) {
            let map_text = stitcher.save().unwrap_or_default();
            let path = self.config.output.with_extension("js.map");
            tokio::fs::write(&path, map_text.as_bytes())
                .await
                .with_path(path.clone())?;
            let map_file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            writer
                .append(format!("//# sourceMappingURL={map_file_name}\n").as_bytes())
                .await?;
            Some(path)
        } else {
            None
        };

        let declaration_path = if declaration_text.is_empty() {
            None
        } else {
            let path = self.config.output.with_extension("d.ts");
            tokio::fs::write(&path, declaration_text.as_bytes())
                .await
                .with_path(path.clone())?;
            Some(path)
        };

        let output = BundleOutput {
            output_path: self.config.output.clone(),
            source_map_path,
            declaration_path,
            module_count: nodes.iter().filter(|n| !n.id.is_external()).count(),
            error_count: self.error_count(),
        };
        crate::logging::log_bundle_complete(&output.output_path, output.module_count, output.error_count);
        Ok(output)
    }

    /// Resolves and walks a single module's import graph starting at
    /// `entry`, returning its arena index. Uses an explicit work stack
    /// rather than recursive `async fn` calls, so import chains of
    /// arbitrary depth don't grow the async state machine unboundedly.
    ///
    /// Consults the refinement cache immediately after allocating each
    /// module's cache id: a hit reuses its cached `imports` to keep
    /// discovering children, so a warm walk never calls back into the
    /// transform engine (`classify`/`parser.parse`) for that module.
    async fn walk_module(
        &self,
        entry: &Path,
        is_primary_entry: bool,
        nodes: &mut Vec<BundlerModule>,
        by_apath: &mut HashMap<PathBuf, u32>,
        dependencies: &mut Vec<PathBuf>,
        node_work: &mut Vec<Option<NodeWork>>,
        queue: &ConcurrencyQueue,
    ) -> BundlerResult<u32> {
        struct PendingVisit {
            apath: PathBuf,
            is_entry: bool,
            parent: Option<u32>,
        }

        let mut stack = vec![PendingVisit {
            apath: entry.to_path_buf(),
            is_entry: is_primary_entry,
            parent: None,
        }];
        let mut entry_index = None;

        while let Some(visit) = stack.pop() {
            if let Some(&existing) = by_apath.get(&visit.apath) {
                if let Some(parent) = visit.parent {
                    nodes[parent as usize].children.push(existing);
                }
                if entry_index.is_none() && visit.is_entry {
                    entry_index = Some(existing);
                }
                continue;
            }

            dependencies.push(visit.apath.clone());
            // The entry module gets the reserved `__entry` var name
            // regardless of its filename; every other module's name is
            // derived from its file stem (or parent directory, for an
            // `index` file).
            let stem = if visit.is_entry {
                ENTRY_VAR_NAME.to_string()
            } else {
                let raw_stem = visit
                    .apath
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "module".to_string());
                if raw_stem == "index" {
                    visit
                        .apath
                        .parent()
                        .and_then(|p| p.file_name())
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or(raw_stem)
                } else {
                    raw_stem
                }
            };
            let (number, var_name) = self
                .registry
                .allocate_cache_id(&self.config.output, &visit.apath, &stem)
                .await?;

            let kind = if visit.apath.extension().map(|e| e == "json").unwrap_or(false) {
                ScriptKind::Json
            } else if visit.apath.to_string_lossy().ends_with(".d.ts") {
                ScriptKind::DeclarationOnly
            } else {
                ScriptKind::Script
            };

            let id = ModuleId {
                number,
                var_name: var_name.clone(),
                apath: visit.apath.clone(),
                kind,
            };
            let rpath = visit.apath.to_string_lossy().into_owned();
            let mpath = format!("./{stem}");
            let node_index = nodes.len() as u32;
            nodes.push(BundlerModule::new(id, rpath, mpath, visit.is_entry));
            by_apath.insert(visit.apath.clone(), node_index);
            node_work.push(None);

            if let Some(parent) = visit.parent {
                nodes[parent as usize].children.push(node_index);
            }
            if visit.is_entry {
                entry_index = Some(node_index);
            }

            let source_mtime = std::fs::metadata(&visit.apath)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let declaration_mtime = declaration_mtime_for(&visit.apath);

            let cached = self
                .cache
                .get_refined(
                    number,
                    source_mtime,
                    declaration_mtime,
                    self.config.config_mtime,
                )
                .await
                .unwrap_or(None);

            let mut import_infos: Vec<ImportInfo> = Vec::new();
            if let Some(cached) = cached {
                import_infos = cached.imports.clone();
                self.cache.release(number).await;
                node_work[node_index as usize] = Some(NodeWork::CacheHit(cached));
            } else {
                let transformer = ModuleTransformer::new(
                    self.parser.as_ref(),
                    self.resolver.as_ref(),
                    &self.config,
                );
                let apath = visit.apath.clone();
                match queue.run(async { transformer.classify(&apath) }).await {
                    Ok((unit, classified)) => {
                        import_infos = classified.iter().map(|c| c.info.clone()).collect();
                        node_work[node_index as usize] = Some(NodeWork::Pending {
                            unit,
                            classified,
                            source_mtime,
                            declaration_mtime,
                        });
                    }
                    Err(diag) => {
                        tracing::error!(apath = %visit.apath.display(), message = %diag.message, "failed to classify imports");
                        node_work[node_index as usize] = Some(NodeWork::Errored(diag));
                    }
                }
            }

            for info in &import_infos {
                if info.is_declaration {
                    continue;
                }
                match &info.target {
                    ImportTarget::Local(child_path) => {
                        stack.push(PendingVisit {
                            apath: child_path.clone(),
                            is_entry: false,
                            parent: Some(node_index),
                        });
                    }
                    ImportTarget::External(ExternalMode::Preimport) => {
                        let synthetic =
                            external_synthetic_path(ExternalMode::Preimport, &info.module_specifier);
                        if !by_apath.contains_key(&synthetic) {
                            let ext_var_name = self
                                .registry
                                .allocate_external_var_name(
                                    &self.config.output,
                                    &info.module_specifier,
                                )
                                .await;
                            let ext_id = ModuleId::external(
                                ExternalMode::Preimport,
                                ext_var_name.clone(),
                                synthetic.clone(),
                            );
                            let ext_index = nodes.len() as u32;
                            nodes.push(BundlerModule::new(
                                ext_id,
                                info.module_specifier.clone(),
                                format!("./{ext_var_name}"),
                                false,
                            ));
                            by_apath.insert(synthetic, ext_index);
                            node_work.push(None);
                        }
                    }
                    // A manual external is left untouched at its reference
                    // site, so it never becomes a graph node.
                    ImportTarget::External(ExternalMode::Manual) => {}
                }
            }
        }

        entry_index.ok_or_else(|| BundlerError::internal("entry module was not visited"))
    }
}

/// Wraps a classified-but-not-yet-cached module: builds its property chunk
/// via `ModuleWrapper`, assembles the `RefinedModule` with its real mtimes,
/// and saves it back to the cache. Free-standing (rather than a method on
/// `BundleAssembler`) so it can be spawned as an independent task per
/// module, bounded by the shared `ConcurrencyQueue`.
#[allow(clippy::too_many_arguments)]
async fn finish_refinement(
    cache: Arc<RefinementCache>,
    config: BundleConfig,
    module_number: i64,
    var_name: String,
    rpath: String,
    unit: ParsedUnit,
    classified: Vec<ClassifiedImport>,
    source_mtime: SystemTime,
    declaration_mtime: Option<SystemTime>,
    path_to_varname: Arc<HashMap<PathBuf, String>>,
) -> Result<RefinedModule, Diagnostic> {
    let config_mtime = config.config_mtime;
    let wrapper = ModuleWrapper::new(config);
    let transformed = wrapper.wrap(&var_name, &rpath, &unit, &classified, |item| {
        match &item.info.target {
            ImportTarget::Local(p) => path_to_varname.get(p).cloned(),
            ImportTarget::External(mode) => {
                let synthetic = external_synthetic_path(*mode, &item.info.module_specifier);
                path_to_varname.get(&synthetic).cloned()
            }
        }
    });

    let mut refined = RefinedModule::new(
        transformed.wrapped_content,
        transformed.imports,
        source_mtime,
        declaration_mtime,
        config_mtime,
    );
    refined.declaration = transformed.declaration;
    refined.global_declaration = transformed.global_declaration;
    refined.uses_module = unit.uses_module;
    refined.uses_exports = unit.uses_exports;

    let _ = cache.save(module_number, refined.clone()).await;
    Ok(refined)
}

fn errored_placeholder(node: &BundlerModule, diag: &Diagnostic) -> RefinedModule {
    let content = format!(
        "  {}() {{\n    throw new Error({:?});\n  }},\n",
        node.id.var_name, diag.message
    );
    let mut refined = RefinedModule::new(
        content,
        Vec::new(),
        SystemTime::UNIX_EPOCH,
        None,
        SystemTime::UNIX_EPOCH,
    );
    refined.errored = true;
    refined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StaticImportParserEngine;
    use crate::resolver::NodeModuleResolver;
    use std::sync::atomic::Ordering;

    fn tempdir(name: &str) -> PathBuf {
        use std::sync::atomic::AtomicU64;
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut dir = std::env::temp_dir();
        dir.push(format!("bundler-core-assembler-{name}-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn bundles_two_modules_into_one_output() {
        let dir = tempdir("two-modules");
        std::fs::write(dir.join("utils.ts"), "export const helper = 1;\n").unwrap();
        std::fs::write(
            dir.join("main.ts"),
            "import { helper } from './utils';\nconsole.log(helper);\n",
        )
        .unwrap();

        let output = dir.join("out/bundle.js");
        let config = BundleConfig::for_entry(dir.join("main.ts"), output.clone()).unwrap();
        let cache_dir = dir.join(".cache");
        let assembler = BundleAssembler::new(
            config,
            cache_dir,
            Box::new(StaticImportParserEngine::new()),
            Box::new(NodeModuleResolver::new()),
        )
        .await;

        let result = assembler.bundle().await.unwrap();
        assert_eq!(result.module_count, 2);
        assert_eq!(result.error_count, 0);

        let content = std::fs::read_to_string(&output).unwrap();
        // Cache ids/var names come from the process-wide registry
        // singleton, so exact numbers depend on test execution order; only
        // shape and relative ordering are asserted here.
        assert_eq!(content.matches("() {\n").count(), 2);
        assert!(content.contains("helper"));

        let utils_pos = content.find("utils() {").expect("utils chunk present");
        let entry_pos = content
            .find(&format!("{ENTRY_VAR_NAME}() {{"))
            .expect("entry chunk present");
        assert!(utils_pos < entry_pos, "child chunk must precede the entry chunk");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_import_is_per_module_and_does_not_abort_the_bundle() {
        let dir = tempdir("missing-import");
        std::fs::write(
            dir.join("main.ts"),
            "import { nope } from './does-not-exist';\n",
        )
        .unwrap();

        let output = dir.join("out/bundle.js");
        let config = BundleConfig::for_entry(dir.join("main.ts"), output.clone()).unwrap();
        let cache_dir = dir.join(".cache");
        let assembler = BundleAssembler::new(
            config,
            cache_dir,
            Box::new(StaticImportParserEngine::new()),
            Box::new(NodeModuleResolver::new()),
        )
        .await;

        let result = assembler.bundle().await.unwrap();
        assert_eq!(result.error_count, 1);
        assert!(output.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn reentrant_bundle_call_is_rejected_while_busy() {
        let dir = tempdir("busy");
        std::fs::write(dir.join("main.ts"), "const x = 1;\n").unwrap();
        let output = dir.join("out/bundle.js");
        let config = BundleConfig::for_entry(dir.join("main.ts"), output.clone()).unwrap();
        let cache_dir = dir.join(".cache");
        let assembler = BundleAssembler::new(
            config,
            cache_dir,
            Box::new(StaticImportParserEngine::new()),
            Box::new(NodeModuleResolver::new()),
        )
        .await;

        assembler.busy.store(true, Ordering::Release);
        let result = assembler.bundle().await;
        assert!(result.is_err());
        assembler.busy.store(false, Ordering::Release);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn preimport_external_gets_require_property_with_sentinel_id() {
        let dir = tempdir("preimport");
        std::fs::write(
            dir.join("main.ts"),
            "import { sep } from 'path';\nexport const p = sep;\n",
        )
        .unwrap();

        let output = dir.join("out/bundle.js");
        let mut config = BundleConfig::for_entry(dir.join("main.ts"), output.clone()).unwrap();
        config.preimport = vec!["path".to_string()];
        let cache_dir = dir.join(".cache");
        let assembler = BundleAssembler::new(
            config,
            cache_dir,
            Box::new(StaticImportParserEngine::new()),
            Box::new(NodeModuleResolver::new()),
        )
        .await;

        let result = assembler.bundle().await.unwrap();
        assert_eq!(result.error_count, 0);

        let content = std::fs::read_to_string(&output).unwrap();
        assert!(content.contains(": require(\"path\")"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
