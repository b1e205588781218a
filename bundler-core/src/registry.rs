//! Process-wide module-identifier registry: integer id allocation, short-name
//! disambiguation, and persistence of the cache map that lets refinements
//! survive across runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};

use crate::error::{BundlerError, BundlerResult, IoResultExt};

/// On-disk format version for the cache map. A mismatch invalidates the
/// whole map rather than attempting a field-by-field migration.
pub const CACHE_MAP_VERSION: &str = "1";

/// How long an unaccessed cache entry is kept before it's eligible for
/// pruning (24 hours).
const ENTRY_TTL_SECS: u64 = 24 * 60 * 60;

/// One module's allocated identity within one output's cache map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMapEntry {
    pub id: i64,
    pub var_name: String,
    pub expires_at: u64,
    /// Not persisted across a save/load cycle's own lifetime in the sense
    /// that a freshly loaded map starts every entry as not-accessed; set by
    /// `allocate_cache_id`/`touch` as modules are visited during a run.
    #[serde(skip)]
    pub accessed_this_run: bool,
}

/// `HashMap<output, HashMap<apath, CacheMapEntry>>` plus a version gate,
/// persisted as JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMap {
    pub version: String,
    pub outputs: HashMap<PathBuf, HashMap<PathBuf, CacheMapEntry>>,
}

impl Default for CacheMap {
    fn default() -> Self {
        Self {
            version: CACHE_MAP_VERSION.to_string(),
            outputs: HashMap::new(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Turns a module's source-file stem into a JS-identifier-safe variable
/// name: non-identifier characters become `_`, and a leading digit gets a
/// `_` prefix.
pub fn sanitize_stem(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    for (i, c) in stem.chars().enumerate() {
        if c.is_alphanumeric() || c == '_' || c == '$' {
            if i == 0 && c.is_ascii_digit() {
                out.push('_');
            }
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Process-wide registry of cache ids and var-name disambiguation for one
/// in-process bundler instance. Lives behind a lazily-initialized
/// `Arc`-wrapped singleton (`get_instance`) since every `BundleAssembler`
/// in a process shares one cache-id space and one cache-map file.
pub struct Registry {
    cache_map: Mutex<CacheMap>,
    cache_map_path: PathBuf,
    disk_dir: PathBuf,
    freelist: Mutex<Vec<i64>>,
    last_cache_id: Mutex<i64>,
    /// Per-output set of var names already assigned, for disambiguation.
    used_names: Mutex<HashMap<PathBuf, HashMap<String, u32>>>,
    needs_resave: AtomicBool,
    /// Which `BundleAssembler` instance (by its process-local id) owns each
    /// output path. A second, distinct assembler targeting an output another
    /// instance already claimed is a configuration error (`Duplicated`),
    /// not a race to arbitrate — the same instance re-bundling the same
    /// output (watch-mode rebuilds) is expected and always allowed.
    claimed_outputs: Mutex<HashMap<PathBuf, u64>>,
}

static INSTANCE: OnceCell<std::sync::Arc<Registry>> = OnceCell::const_new();

impl Registry {
    fn new(disk_dir: PathBuf, cache_map: CacheMap) -> Self {
        let last_cache_id = cache_map
            .outputs
            .values()
            .flat_map(|m| m.values())
            .map(|e| e.id)
            .max()
            .unwrap_or(-1);
        Self {
            cache_map: Mutex::new(cache_map),
            cache_map_path: disk_dir.join("cache-map.json"),
            disk_dir,
            freelist: Mutex::new(Vec::new()),
            last_cache_id: Mutex::new(last_cache_id),
            used_names: Mutex::new(HashMap::new()),
            needs_resave: AtomicBool::new(false),
            claimed_outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Claims `output` for `instance_id`, rejecting the claim with
    /// `BundlerError::Duplicated` if a *different* instance already owns it.
    /// Idempotent for the same instance, so repeated bundles from one
    /// `BundleAssembler` (watch-mode rebuilds) never trip this check.
    pub async fn claim_output(&self, output: &Path, instance_id: u64) -> BundlerResult<()> {
        let mut claimed = self.claimed_outputs.lock().await;
        match claimed.get(output) {
            Some(&owner) if owner != instance_id => {
                Err(BundlerError::duplicated(output.to_path_buf()))
            }
            _ => {
                claimed.insert(output.to_path_buf(), instance_id);
                Ok(())
            }
        }
    }

    /// Returns the process-wide singleton, loading the persisted cache map
    /// from `disk_dir/cache-map.json` on first call. Subsequent calls with
    /// a different `disk_dir` are ignored (the singleton is keyed to the
    /// first caller, matching the distilled spec's "process-wide" scope).
    pub async fn get_instance(disk_dir: &Path) -> std::sync::Arc<Registry> {
        INSTANCE
            .get_or_init(|| async {
                let loaded = Self::load_cache_map(disk_dir).await.unwrap_or_default();
                std::sync::Arc::new(Registry::new(disk_dir.to_path_buf(), loaded))
            })
            .await
            .clone()
    }

    async fn load_cache_map(disk_dir: &Path) -> BundlerResult<CacheMap> {
        let path = disk_dir.join("cache-map.json");
        if !path.exists() {
            return Ok(CacheMap::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_path(path.clone())?;
        let map: CacheMap = serde_json::from_str(&content)
            .map_err(|e| BundlerError::config(path.clone(), format!("invalid cache map: {e}")))?;
        if map.version != CACHE_MAP_VERSION {
            tracing::warn!(path = %path.display(), found = %map.version, expected = CACHE_MAP_VERSION, "cache map version mismatch, starting fresh");
            return Ok(CacheMap::default());
        }
        Ok(map)
    }

    pub async fn get_cache_map(&self) -> tokio::sync::MutexGuard<'_, CacheMap> {
        self.cache_map.lock().await
    }

    /// Allocates (or reuses, from the cache map / freelist) a cache id and
    /// disambiguated var name for `apath` under `output`. Marks the entry
    /// accessed this run.
    pub async fn allocate_cache_id(
        &self,
        output: &Path,
        apath: &Path,
        stem: &str,
    ) -> BundlerResult<(i64, String)> {
        let mut map = self.cache_map.lock().await;
        let inner = map.outputs.entry(output.to_path_buf()).or_default();

        if let Some(existing) = inner.get_mut(apath) {
            existing.accessed_this_run = true;
            existing.expires_at = now_secs() + ENTRY_TTL_SECS;
            return Ok((existing.id, existing.var_name.clone()));
        }

        let id = {
            let mut freelist = self.freelist.lock().await;
            if let Some(reused) = freelist.pop() {
                reused
            } else {
                let mut last = self.last_cache_id.lock().await;
                *last += 1;
                *last
            }
        };

        let var_name = self.disambiguate(output, stem).await;

        // Best-effort cleanup of a stale on-disk file from a previous
        // allocation cycle that reused this id for a different module.
        let stale_path = self.disk_dir.join(format!("{id}.cache"));
        if stale_path.exists() {
            let _ = tokio::fs::remove_file(&stale_path).await;
        }

        inner.insert(
            apath.to_path_buf(),
            CacheMapEntry {
                id,
                var_name: var_name.clone(),
                expires_at: now_secs() + ENTRY_TTL_SECS,
                accessed_this_run: true,
            },
        );
        self.needs_resave.store(true, Ordering::Release);
        Ok((id, var_name))
    }

    /// Disambiguates a var name for an external (manual or preimport)
    /// import, keyed by its own specifier rather than an on-disk apath —
    /// externals never get a cache id or a disk file, only a name.
    pub async fn allocate_external_var_name(&self, output: &Path, specifier: &str) -> String {
        let stem = specifier
            .rsplit('/')
            .next()
            .unwrap_or(specifier)
            .trim_start_matches('@');
        self.disambiguate(output, stem).await
    }

    async fn disambiguate(&self, output: &Path, stem: &str) -> String {
        let base = sanitize_stem(stem);
        let mut used = self.used_names.lock().await;
        let table = used.entry(output.to_path_buf()).or_default();
        let count = table.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base.clone()
        } else {
            format!("{base}{}", *count + 1)
        };
        *count += 1;
        name
    }

    /// Frees a cache id, returning it to the freelist and deleting its
    /// backing on-disk cache file. If the freed id is immediately below the
    /// current tail (`last_cache_id`), the tail is absorbed downward
    /// instead, so freelist growth stays bounded under steady LIFO
    /// free/allocate churn at the end of the id space.
    pub async fn free_cache_id(&self, output: &Path, apath: &Path) {
        let id = {
            let mut map = self.cache_map.lock().await;
            let Some(inner) = map.outputs.get_mut(output) else {
                return;
            };
            let Some(entry) = inner.remove(apath) else {
                return;
            };
            entry.id
        };

        let mut last = self.last_cache_id.lock().await;
        if id == *last {
            *last -= 1;
            let mut freelist = self.freelist.lock().await;
            freelist.sort_unstable();
            while freelist.last() == Some(&*last) {
                freelist.pop();
                *last -= 1;
            }
        } else {
            let mut freelist = self.freelist.lock().await;
            freelist.push(id);
        }
        drop(last);
        self.needs_resave.store(true, Ordering::Release);

        let path = self.disk_dir.join(format!("{id}.cache"));
        let _ = tokio::fs::remove_file(&path).await;
    }

    /// Frees every id in `output`'s cache map whose `apath` is not in
    /// `still_present`, i.e. modules that existed in a previous run but were
    /// not reached while walking the current one (deleted or no longer
    /// imported). Only called after a run completes successfully, since a
    /// run that aborted early never reached modules it would otherwise still
    /// depend on (preserve-on-failure).
    pub async fn sweep_removed_modules(&self, output: &Path, still_present: &[PathBuf]) {
        let stale: Vec<PathBuf> = {
            let map = self.cache_map.lock().await;
            let Some(inner) = map.outputs.get(output) else {
                return;
            };
            inner
                .keys()
                .filter(|apath| !still_present.contains(apath))
                .cloned()
                .collect()
        };
        for apath in stale {
            self.free_cache_id(output, &apath).await;
        }
    }

    /// Prunes inner maps whose entries have both expired and were not
    /// accessed this run (preserve-on-failure): a bundle run that
    /// aborted before reaching a module never marks it accessed, so that
    /// module only ages out on its normal 24h schedule rather than being
    /// force-evicted by the failed run.
    pub async fn prune_expired(&self) {
        let mut map = self.cache_map.lock().await;
        let now = now_secs();
        for inner in map.outputs.values_mut() {
            inner.retain(|_, entry| entry.accessed_this_run || entry.expires_at > now);
        }
        self.needs_resave.store(true, Ordering::Release);
    }

    /// Persists the cache map to disk if it has changed since the last
    /// save, via an atomic temp-file-then-rename write.
    pub async fn save_cache_json(&self) -> BundlerResult<()> {
        if !self.needs_resave.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let map = self.cache_map.lock().await;
        let json = serde_json::to_string_pretty(&*map)
            .map_err(|e| BundlerError::internal(format!("failed to serialize cache map: {e}")))?;
        drop(map);

        tokio::fs::create_dir_all(&self.disk_dir)
            .await
            .with_path(self.disk_dir.clone())?;
        let tmp_path = self.cache_map_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .with_path(tmp_path.clone())?;
        tokio::fs::rename(&tmp_path, &self.cache_map_path)
            .await
            .with_path(self.cache_map_path.clone())?;
        Ok(())
    }

    /// Synchronous flush for use at process-exit paths where async code
    /// cannot run (e.g. a `Drop` impl or a signal handler). Blocks the
    /// calling thread; callers invoke this explicitly after `bundle()`
    /// returns rather than relying on `Drop`, since `Drop` can't `.await`.
    pub fn save_cache_json_sync(&self) -> BundlerResult<()> {
        if !self.needs_resave.load(Ordering::Acquire) {
            return Ok(());
        }
        let map = self
            .cache_map
            .try_lock()
            .map_err(|_| BundlerError::internal("cache map locked during sync save"))?;
        let json = serde_json::to_string_pretty(&*map)
            .map_err(|e| BundlerError::internal(format!("failed to serialize cache map: {e}")))?;
        drop(map);

        std::fs::create_dir_all(&self.disk_dir).with_path(self.disk_dir.clone())?;
        let tmp_path = self.cache_map_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json.as_bytes()).with_path(tmp_path.clone())?;
        std::fs::rename(&tmp_path, &self.cache_map_path).with_path(self.cache_map_path.clone())?;
        self.needs_resave.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_stem_replaces_non_identifier_chars() {
        assert_eq!(sanitize_stem("my-module.v2"), "my_module_v2");
        assert_eq!(sanitize_stem("2fast"), "_2fast");
        assert_eq!(sanitize_stem("ok_name"), "ok_name");
    }

    #[tokio::test]
    async fn allocate_reuses_existing_entry_for_same_apath() {
        let dir = tempdir();
        let registry = Registry::new(dir.clone(), CacheMap::default());
        let (id1, name1) = registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/a.ts"), "a")
            .await
            .unwrap();
        let (id2, name2) = registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/a.ts"), "a")
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(name1, name2);
    }

    #[tokio::test]
    async fn allocate_disambiguates_colliding_stems() {
        let dir = tempdir();
        let registry = Registry::new(dir.clone(), CacheMap::default());
        let (_, name1) = registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/a/utils.ts"), "utils")
            .await
            .unwrap();
        let (_, name2) = registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/b/utils.ts"), "utils")
            .await
            .unwrap();
        assert_eq!(name1, "utils");
        assert_eq!(name2, "utils2");
    }

    #[tokio::test]
    async fn free_cache_id_absorbs_tail() {
        let dir = tempdir();
        let registry = Registry::new(dir.clone(), CacheMap::default());
        let (id0, _) = registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/a.ts"), "a")
            .await
            .unwrap();
        let (id1, _) = registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/b.ts"), "b")
            .await
            .unwrap();
        assert_eq!(id1, id0 + 1);

        registry.free_cache_id(Path::new("out.js"), Path::new("/b.ts")).await;
        let last = *registry.last_cache_id.lock().await;
        assert_eq!(last, id0);
    }

    #[tokio::test]
    async fn prune_expired_keeps_accessed_entries() {
        let dir = tempdir();
        let registry = Registry::new(dir.clone(), CacheMap::default());
        registry
            .allocate_cache_id(Path::new("out.js"), Path::new("/a.ts"), "a")
            .await
            .unwrap();
        registry.prune_expired().await;
        let map = registry.cache_map.lock().await;
        assert_eq!(map.outputs.get(Path::new("out.js")).unwrap().len(), 1);
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut dir = std::env::temp_dir();
        dir.push(format!("bundler-core-registry-test-{}-{n}", std::process::id()));
        dir
    }
}
