//! Module identity and graph-node types.
//!
//! Modules are stored in an arena (`BundleGraph::nodes`, see `assembler`) and
//! referenced by `u32` index rather than by owning pointer, so that the
//! import graph's back-edges (cycles) don't require unsafe or reference
//! counting to express, since modules can form cycles.

use std::cell::Cell;
use std::path::PathBuf;

/// A negative `number` on a `ModuleId` encodes an external mode rather than
/// a real arena slot. `Manual` is a user-declared external (matched by an
/// `externals` glob); `Preimport` is resolved through the host's `require`
/// at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalMode {
    Manual,
    Preimport,
}

impl ExternalMode {
    /// The sentinel `number` this mode is encoded as on a `ModuleId`.
    pub const fn sentinel(self) -> i64 {
        match self {
            ExternalMode::Manual => -1,
            ExternalMode::Preimport => -2,
        }
    }

    pub fn from_sentinel(n: i64) -> Option<Self> {
        match n {
            -1 => Some(ExternalMode::Manual),
            -2 => Some(ExternalMode::Preimport),
            _ => None,
        }
    }
}

/// The kind of source a module file contains, as classified by extension
/// during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Script,
    Json,
    /// A `.d.ts`-only module: no runtime body, declarations only.
    DeclarationOnly,
}

/// `(number, varName, apath, kind)`. `number` is unique per output
/// bundle across the process (via the registry); negative values are
/// `ExternalMode` sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleId {
    pub number: i64,
    pub var_name: String,
    pub apath: PathBuf,
    pub kind: ScriptKind,
}

impl ModuleId {
    pub fn external(mode: ExternalMode, var_name: impl Into<String>, apath: PathBuf) -> Self {
        Self {
            number: mode.sentinel(),
            var_name: var_name.into(),
            apath,
            kind: ScriptKind::Script,
        }
    }

    pub fn is_external(&self) -> bool {
        self.number < 0
    }

    pub fn external_mode(&self) -> Option<ExternalMode> {
        ExternalMode::from_sentinel(self.number)
    }
}

/// Where an import resolves to: a local arena module, or an external mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    Local(PathBuf),
    External(ExternalMode),
}

/// `(target, moduleSpecifier, codePos?, isDeclaration)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportInfo {
    pub target: ImportTarget,
    pub module_specifier: String,
    pub code_pos: Option<usize>,
    pub is_declaration: bool,
}

/// DFS paint state used by cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    None,
    Entered,
    Checked,
}

/// The in-graph node for one module within one bundle run. Created once
/// per `(bundle, apath)` pair and destroyed when the run ends; children
/// are referenced by arena index, not by owning handle.
#[derive(Debug)]
pub struct BundlerModule {
    pub id: ModuleId,
    /// Path relative to the bundle base directory, for diagnostics.
    pub rpath: String,
    /// Module-specifier-shaped path (relative, `/`-separated).
    pub mpath: String,
    pub children: Vec<u32>,
    pub import_lines: Vec<ImportInfo>,
    pub is_appended: Cell<bool>,
    pub is_entry: bool,
    pub check_state: Cell<CheckState>,
}

impl BundlerModule {
    pub fn new(id: ModuleId, rpath: String, mpath: String, is_entry: bool) -> Self {
        Self {
            id,
            rpath,
            mpath,
            children: Vec::new(),
            import_lines: Vec::new(),
            is_appended: Cell::new(is_entry),
            is_entry,
            check_state: Cell::new(CheckState::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_mode_round_trips_through_sentinel() {
        assert_eq!(ExternalMode::from_sentinel(-1), Some(ExternalMode::Manual));
        assert_eq!(
            ExternalMode::from_sentinel(-2),
            Some(ExternalMode::Preimport)
        );
        assert_eq!(ExternalMode::from_sentinel(0), None);
    }

    #[test]
    fn module_id_is_external_iff_number_negative() {
        let local = ModuleId {
            number: 3,
            var_name: "utils".into(),
            apath: PathBuf::from("/src/utils.ts"),
            kind: ScriptKind::Script,
        };
        assert!(!local.is_external());

        let ext = ModuleId::external(
            ExternalMode::Preimport,
            "path",
            PathBuf::from("<preimport:path>"),
        );
        assert!(ext.is_external());
        assert_eq!(ext.number, -2);
        assert_eq!(ext.external_mode(), Some(ExternalMode::Preimport));
    }

    #[test]
    fn new_module_starts_unchecked_and_not_entered() {
        let id = ModuleId {
            number: 0,
            var_name: "main".into(),
            apath: PathBuf::from("/src/main.ts"),
            kind: ScriptKind::Script,
        };
        let m = BundlerModule::new(id, "main.ts".into(), "./main".into(), true);
        assert_eq!(m.check_state.get(), CheckState::None);
        assert!(m.is_appended.get());
        assert!(m.is_entry);
    }
}
