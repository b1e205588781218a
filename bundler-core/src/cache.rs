//! The incremental refinement cache: a two-tier store — a bounded
//! in-memory LRU backed by an on-disk, NUL-delimited file per module id —
//! keyed by integer cache id and validated against three mtimes (source,
//! declaration side-file, config) rather than content hashes.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;

use crate::concurrency::SkipableTaskQueue;
use crate::error::{BundlerError, BundlerResult, IoResultExt};
use crate::module::ImportInfo;
use crate::namelock::NameLock;

/// On-disk format signature, written as the final field of every cache
/// file. A mismatched or missing signature invalidates the file the same
/// way a version mismatch does.
pub const CACHE_FILE_SIGNATURE: &str = "TSBC-0.10";

const FIELD_SEP: u8 = 0;

/// One module's refined (transformed) output, as produced by
/// `transform::ModuleTransformer` and cached by id.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedModule {
    pub first_line_comment: Option<String>,
    pub source_map_output_line_offset: u32,
    pub output_line_count: u32,
    pub imports: Vec<ImportInfo>,
    pub content: String,
    pub declaration: Option<String>,
    pub global_declaration: Option<String>,
    pub source_map_text: Option<String>,
    pub source_mtime: SystemTime,
    pub declaration_mtime: Option<SystemTime>,
    pub config_mtime: SystemTime,
    pub errored: bool,
    pub size: usize,
    /// Whether the refined source assigns `module.exports`/reads `exports.`,
    /// carried through the cache so the entry's export epilogue (`module:
    /// direct`) can be validated on a cache hit without re-parsing.
    pub uses_module: bool,
    pub uses_exports: bool,
}

impl RefinedModule {
    /// Constructs a `RefinedModule`, asserting the invariant that
    /// `output_line_count` matches the newline count of `content`.
    pub fn new(
        content: String,
        imports: Vec<ImportInfo>,
        source_mtime: SystemTime,
        declaration_mtime: Option<SystemTime>,
        config_mtime: SystemTime,
    ) -> Self {
        let output_line_count = content.matches('\n').count() as u32;
        let size = content.len();
        Self {
            first_line_comment: None,
            source_map_output_line_offset: 0,
            output_line_count,
            imports,
            content,
            declaration: None,
            global_declaration: None,
            source_map_text: None,
            source_mtime,
            declaration_mtime,
            config_mtime,
            errored: false,
            size,
            uses_module: false,
            uses_exports: false,
        }
    }

    fn assert_invariant(&self) {
        debug_assert_eq!(
            self.output_line_count as usize,
            self.content.matches('\n').count(),
            "output_line_count must track content's newline count"
        );
    }

    fn to_bytes(&self) -> Vec<u8> {
        fn epoch_millis(t: SystemTime) -> u128 {
            t.duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
        }

        let imports_json = serde_json::to_string(&ImportsOnWire::from(&self.imports[..]))
            .unwrap_or_else(|_| "[]".to_string());

        let fields: Vec<String> = vec![
            self.content.clone(),
            self.declaration.clone().unwrap_or_default(),
            self.global_declaration.clone().unwrap_or_default(),
            self.source_map_text.clone().unwrap_or_default(),
            imports_json,
            self.first_line_comment.clone().unwrap_or_default(),
            self.source_map_output_line_offset.to_string(),
            self.output_line_count.to_string(),
            epoch_millis(self.source_mtime).to_string(),
            self.declaration_mtime
                .map(epoch_millis)
                .map(|m| m.to_string())
                .unwrap_or_default(),
            epoch_millis(self.config_mtime).to_string(),
            if self.errored { "1" } else { "0" }.to_string(),
            self.size.to_string(),
            if self.uses_module { "1" } else { "0" }.to_string(),
            if self.uses_exports { "1" } else { "0" }.to_string(),
            CACHE_FILE_SIGNATURE.to_string(),
        ];

        let mut out = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(FIELD_SEP);
            }
            out.extend_from_slice(field.as_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8]) -> BundlerResult<Self> {
        let parts: Vec<&[u8]> = bytes.split(|&b| b == FIELD_SEP).collect();
        if parts.len() != 16 {
            return Err(BundlerError::internal("malformed cache file: field count"));
        }
        let signature = std::str::from_utf8(parts[15]).unwrap_or("");
        if signature != CACHE_FILE_SIGNATURE {
            return Err(BundlerError::internal("cache file signature mismatch"));
        }

        fn s(part: &[u8]) -> String {
            String::from_utf8_lossy(part).into_owned()
        }
        fn opt_s(part: &[u8]) -> Option<String> {
            let v = s(part);
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        fn millis_to_time(part: &[u8]) -> Option<SystemTime> {
            let v = s(part);
            if v.is_empty() {
                return None;
            }
            v.parse::<u64>()
                .ok()
                .map(|m| SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(m))
        }

        let imports: Vec<ImportInfo> =
            serde_json::from_slice::<ImportsOnWire>(parts[4])
                .map(|w| w.into())
                .unwrap_or_default();

        let source_mtime = millis_to_time(parts[8])
            .ok_or_else(|| BundlerError::internal("malformed cache file: source_mtime"))?;
        let config_mtime = millis_to_time(parts[10])
            .ok_or_else(|| BundlerError::internal("malformed cache file: config_mtime"))?;

        Ok(Self {
            content: s(parts[0]),
            declaration: opt_s(parts[1]),
            global_declaration: opt_s(parts[2]),
            source_map_text: opt_s(parts[3]),
            imports,
            first_line_comment: opt_s(parts[5]),
            source_map_output_line_offset: s(parts[6]).parse().unwrap_or(0),
            output_line_count: s(parts[7]).parse().unwrap_or(0),
            source_mtime,
            declaration_mtime: millis_to_time(parts[9]),
            config_mtime,
            errored: parts[11] == b"1",
            size: s(parts[12]).parse().unwrap_or(0),
            uses_module: parts[13] == b"1",
            uses_exports: parts[14] == b"1",
        })
    }

    /// A cache entry is valid for a given set of current mtimes iff none of
    /// source/declaration/config have moved forward since it was produced.
    pub fn is_valid_for(
        &self,
        current_source_mtime: SystemTime,
        current_declaration_mtime: Option<SystemTime>,
        current_config_mtime: SystemTime,
    ) -> bool {
        self.source_mtime == current_source_mtime
            && self.declaration_mtime == current_declaration_mtime
            && self.config_mtime == current_config_mtime
    }
}

/// Wire shape for `ImportInfo` serialization inside a cache file, kept
/// private so the public `ImportInfo`/`ImportTarget` types don't need to
/// derive serde just for this one caller.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct ImportsOnWire(Vec<ImportOnWire>);

#[derive(serde::Serialize, serde::Deserialize)]
struct ImportOnWire {
    local_target: Option<String>,
    external_mode: Option<i8>,
    module_specifier: String,
    code_pos: Option<usize>,
    is_declaration: bool,
}

impl From<&[ImportInfo]> for ImportsOnWire {
    fn from(imports: &[ImportInfo]) -> Self {
        use crate::module::{ExternalMode, ImportTarget};
        ImportsOnWire(
            imports
                .iter()
                .map(|i| {
                    let (local_target, external_mode) = match &i.target {
                        ImportTarget::Local(p) => (Some(p.to_string_lossy().into_owned()), None),
                        ImportTarget::External(ExternalMode::Manual) => (None, Some(0)),
                        ImportTarget::External(ExternalMode::Preimport) => (None, Some(1)),
                    };
                    ImportOnWire {
                        local_target,
                        external_mode,
                        module_specifier: i.module_specifier.clone(),
                        code_pos: i.code_pos,
                        is_declaration: i.is_declaration,
                    }
                })
                .collect(),
        )
    }
}

impl From<ImportsOnWire> for Vec<ImportInfo> {
    fn from(wire: ImportsOnWire) -> Self {
        use crate::module::{ExternalMode, ImportTarget};
        wire.0
            .into_iter()
            .map(|w| {
                let target = match (w.local_target, w.external_mode) {
                    (Some(p), _) => ImportTarget::Local(PathBuf::from(p)),
                    (None, Some(0)) => ImportTarget::External(ExternalMode::Manual),
                    (None, Some(1)) => ImportTarget::External(ExternalMode::Preimport),
                    _ => ImportTarget::External(ExternalMode::Manual),
                };
                ImportInfo {
                    target,
                    module_specifier: w.module_specifier,
                    code_pos: w.code_pos,
                    is_declaration: w.is_declaration,
                }
            })
            .collect()
    }
}

struct LruCache {
    budget_bytes: u64,
    used_bytes: u64,
    entries: HashMap<i64, RefinedModule>,
    order: VecDeque<i64>,
    pinned: HashMap<i64, u32>,
}

impl LruCache {
    fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
            pinned: HashMap::new(),
        }
    }

    fn touch(&mut self, id: i64) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id);
    }

    fn get(&mut self, id: i64) -> Option<RefinedModule> {
        let found = self.entries.get(&id).cloned();
        if found.is_some() {
            self.touch(id);
            *self.pinned.entry(id).or_insert(0) += 1;
        }
        found
    }

    fn release(&mut self, id: i64) {
        if let Some(count) = self.pinned.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pinned.remove(&id);
            }
        }
    }

    fn insert(&mut self, id: i64, module: RefinedModule) {
        if let Some(old) = self.entries.remove(&id) {
            self.used_bytes = self.used_bytes.saturating_sub(old.size as u64);
        }
        self.used_bytes += module.size as u64;
        self.entries.insert(id, module);
        self.touch(id);
        self.evict_if_needed();
    }

    fn evict_if_needed(&mut self) {
        while self.used_bytes > self.budget_bytes {
            let Some(victim) = self
                .order
                .iter()
                .position(|id| !self.pinned.contains_key(id))
            else {
                break;
            };
            let id = self.order.remove(victim).unwrap();
            if let Some(removed) = self.entries.remove(&id) {
                self.used_bytes = self.used_bytes.saturating_sub(removed.size as u64);
            }
        }
    }

    fn remove(&mut self, id: i64) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        if let Some(removed) = self.entries.remove(&id) {
            self.used_bytes = self.used_bytes.saturating_sub(removed.size as u64);
        }
        self.pinned.remove(&id);
    }
}

/// The disk side of the cache, kept behind an `Arc` so a coalesced save
/// task spawned onto a `SkipableTaskQueue` can outlive the `&self` call
/// that enqueued it.
struct DiskState {
    disk_dir: PathBuf,
    name_lock: NameLock,
}

/// The two-tier refinement cache: a memory-budgeted LRU in front of a
/// per-id disk file, with per-id save coalescing.
pub struct RefinementCache {
    memory: Mutex<LruCache>,
    disk: Arc<DiskState>,
    /// Per-id disk-save coalescing: a module refined repeatedly in quick
    /// succession (e.g. under watch) only has its *latest* refinement
    /// written to disk, not every intermediate one.
    save_queues: Mutex<HashMap<i64, SkipableTaskQueue>>,
}

impl RefinementCache {
    pub fn new(disk_dir: PathBuf, budget_bytes: u64) -> Self {
        Self {
            memory: Mutex::new(LruCache::new(budget_bytes)),
            disk: Arc::new(DiskState {
                disk_dir,
                name_lock: NameLock::new(),
            }),
            save_queues: Mutex::new(HashMap::new()),
        }
    }

    fn disk_path(&self, id: i64) -> PathBuf {
        self.disk.disk_dir.join(format!("{id}.cache"))
    }

    /// Loads a module's refined output, preferring memory, falling back to
    /// disk, validating against the three given current mtimes. Returns
    /// `None` on a cache miss or a stale entry (source/declaration/config
    /// moved forward since the cached refinement was produced).
    pub async fn get_refined(
        &self,
        id: i64,
        current_source_mtime: SystemTime,
        current_declaration_mtime: Option<SystemTime>,
        current_config_mtime: SystemTime,
    ) -> BundlerResult<Option<RefinedModule>> {
        {
            let mut memory = self.memory.lock().await;
            if let Some(hit) = memory.get(id) {
                if hit.is_valid_for(
                    current_source_mtime,
                    current_declaration_mtime,
                    current_config_mtime,
                ) {
                    return Ok(Some(hit));
                }
                memory.remove(id);
                memory.release(id);
            }
        }

        let _guard = self.disk.name_lock.acquire(id).await;
        let path = self.disk_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await.with_path(path.clone())?;
        let module = match RefinedModule::from_bytes(&bytes) {
            Ok(m) => m,
            Err(_) => {
                tracing::warn!(id, path = %path.display(), "cache file signature mismatch, treating as miss");
                return Ok(None);
            }
        };
        if !module.is_valid_for(
            current_source_mtime,
            current_declaration_mtime,
            current_config_mtime,
        ) {
            return Ok(None);
        }

        let mut memory = self.memory.lock().await;
        memory.insert(id, module.clone());
        Ok(Some(module))
    }

    /// Releases a module pinned in memory by a prior `get_refined`, so it
    /// becomes eligible for eviction again.
    pub async fn release(&self, id: i64) {
        let mut memory = self.memory.lock().await;
        memory.release(id);
    }

    /// Saves a refined module to the memory tier immediately, then
    /// schedules the atomic (temp file + rename) disk write onto this id's
    /// `SkipableTaskQueue`. If this module is refined again before the
    /// write lands, only the latest refinement's bytes reach disk — the
    /// memory tier (which every `get_refined` checks first) always has the
    /// latest version regardless of how far behind the disk write is.
    pub async fn save(&self, id: i64, module: RefinedModule) -> BundlerResult<()> {
        module.assert_invariant();
        {
            let mut memory = self.memory.lock().await;
            memory.insert(id, module.clone());
        }

        let disk = self.disk.clone();
        let bytes = module.to_bytes();
        let mut queues = self.save_queues.lock().await;
        let queue = queues.entry(id).or_insert_with(SkipableTaskQueue::new);
        queue.enqueue(async move {
            let _guard = disk.name_lock.acquire(id).await;
            if let Err(e) = tokio::fs::create_dir_all(&disk.disk_dir).await {
                tracing::warn!(id, error = %e, "coalesced cache save: failed to create cache dir");
                return;
            }
            let path = disk.disk_dir.join(format!("{id}.cache"));
            let tmp_path = path.with_extension("cache.tmp");
            if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
                tracing::warn!(id, error = %e, "coalesced cache save: failed to write temp file");
                return;
            }
            if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
                tracing::warn!(id, error = %e, "coalesced cache save: failed to rename temp file");
            }
        });
        Ok(())
    }

    /// Waits for every id's pending coalesced save to land on disk. Callers
    /// that need the disk tier durably up to date before reading it back out
    /// of process (e.g. before a synchronous shutdown flush) await this
    /// first.
    pub async fn join_pending_saves(&self) {
        let queues = self.save_queues.lock().await;
        for queue in queues.values() {
            queue.join().await;
        }
    }

    /// Evicts a module from both tiers, used when its cache id is freed.
    pub async fn evict(&self, id: i64) {
        {
            let mut memory = self.memory.lock().await;
            memory.remove(id);
        }
        {
            let mut queues = self.save_queues.lock().await;
            if let Some(queue) = queues.remove(&id) {
                queue.join().await;
            }
        }
        let _guard = self.disk.name_lock.acquire(id).await;
        let path = self.disk_path(id);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
