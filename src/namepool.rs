//! Bounded pool of reusable worker names.
//!
//! Names are drawn in declared order from a themed list (mad-max by
//! default), so identities stay visually stable across churn: releasing a
//! name makes the earliest-declared free slot the next allocation, not the
//! most recently released one. When the pool is exhausted, overflow names
//! use the `<rig>-N` format and are never reused.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Number of reusable names in a default pool.
pub const DEFAULT_POOL_SIZE: usize = 50;

/// Theme used for new rigs.
pub const DEFAULT_THEME: &str = "mad-max";

const THEME_MAD_MAX: [&str; 50] = [
    "furiosa", "nux", "slit", "rictus", "dementus",
    "capable", "toast", "dag", "cheedo", "valkyrie",
    "keeper", "morsov", "ace", "warboy", "imperator",
    "organic", "coma", "splendid", "angharad", "max",
    "immortan", "bullet", "toecutter", "goose", "nightrider",
    "glory", "scrotus", "chumbucket", "corpus", "dinki",
    "prime", "vuvalini", "rockryder", "wretched", "buzzard",
    "gastown", "bullet-farmer", "citadel", "wasteland", "fury",
    "road-warrior", "interceptor", "blackfinger", "wraith", "witness",
    "chrome", "shiny", "mediocre", "guzzoline", "aqua-cola",
];

const THEME_MINERALS: [&str; 50] = [
    "obsidian", "quartz", "jasper", "onyx", "opal",
    "topaz", "garnet", "ruby", "amber", "jade",
    "pearl", "flint", "granite", "basalt", "marble",
    "shale", "slate", "pyrite", "mica", "agate",
    "malachite", "turquoise", "lapis", "emerald", "sapphire",
    "diamond", "amethyst", "citrine", "zircon", "peridot",
    "coral", "jet", "moonstone", "sunstone", "bloodstone",
    "rhodonite", "sodalite", "hematite", "magnetite", "calcite",
    "fluorite", "selenite", "kyanite", "labradorite", "amazonite",
    "chalcedony", "carnelian", "aventurine", "chrysoprase", "heliodor",
];

const THEME_WASTELAND: [&str; 50] = [
    "rust", "chrome", "nitro", "guzzle", "witness",
    "shiny", "fury", "thunder", "dust", "scavenger",
    "radrat", "ghoul", "mutant", "raider", "vault",
    "pipboy", "nuka", "brahmin", "deathclaw", "mirelurk",
    "synth", "institute", "enclave", "brotherhood", "minuteman",
    "railroad", "atom", "crater", "foundation", "refuge",
    "settler", "wanderer", "courier", "lone", "chosen",
    "tribal", "khan", "legion", "ncr", "ranger",
    "overseer", "sentinel", "paladin", "scribe", "initiate",
    "elder", "lancer", "knight", "squire", "proctor",
];

/// Names in a built-in theme, or None for an unknown theme.
fn builtin_theme(theme: &str) -> Option<&'static [&'static str]> {
    match theme {
        "mad-max" => Some(&THEME_MAD_MAX),
        "minerals" => Some(&THEME_MINERALS),
        "wasteland" => Some(&THEME_WASTELAND),
        _ => None,
    }
}

/// List the available built-in themes.
pub fn list_themes() -> Vec<&'static str> {
    vec!["mad-max", "minerals", "wasteland"]
}

/// Names in a specific built-in theme.
pub fn theme_names(theme: &str) -> anyhow::Result<Vec<String>> {
    builtin_theme(theme)
        .map(|names| names.iter().map(|s| s.to_string()).collect())
        .ok_or_else(|| anyhow::anyhow!("unknown theme: {theme}"))
}

/// Persisted pool state.
#[derive(Debug, Serialize, Deserialize)]
struct PoolState {
    rig_name: String,
    theme: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    custom_names: Vec<String>,
    in_use: BTreeMap<String, bool>,
    overflow_next: usize,
    max_size: usize,
}

/// A bounded pool of reusable worker names for one rig.
///
/// Single writer per instance: share behind a `Mutex` if two components in
/// one process need it. The persisted file is the crash-recovery source of
/// truth, not a coordination channel between processes.
#[derive(Debug)]
pub struct NamePool {
    rig_name: String,
    theme: String,
    custom_names: Vec<String>,
    in_use: BTreeMap<String, bool>,
    overflow_next: usize,
    max_size: usize,
    state_file: PathBuf,
}

impl NamePool {
    /// Create a pool with default theme and size.
    pub fn new(rig_path: &Path, rig_name: &str) -> Self {
        Self::with_config(rig_path, rig_name, "", &[], 0)
    }

    /// Create a pool with explicit configuration. Empty theme and zero
    /// max_size fall back to defaults.
    pub fn with_config(
        rig_path: &Path,
        rig_name: &str,
        theme: &str,
        custom_names: &[String],
        max_size: usize,
    ) -> Self {
        let theme = if theme.is_empty() { DEFAULT_THEME } else { theme };
        let max_size = if max_size == 0 { DEFAULT_POOL_SIZE } else { max_size };

        Self {
            rig_name: rig_name.to_string(),
            theme: theme.to_string(),
            custom_names: custom_names.to_vec(),
            in_use: BTreeMap::new(),
            overflow_next: max_size + 1,
            max_size,
            state_file: rig_path.join(".runtime").join("namepool-state.json"),
        }
    }

    /// The names this pool draws from: custom names when set, otherwise the
    /// theme list (falling back to the default theme for unknown names).
    fn names(&self) -> Vec<&str> {
        if !self.custom_names.is_empty() {
            return self.custom_names.iter().map(String::as_str).collect();
        }
        builtin_theme(&self.theme)
            .or_else(|| builtin_theme(DEFAULT_THEME))
            .expect("default theme exists")
            .to_vec()
    }

    fn is_themed_name(&self, name: &str) -> bool {
        self.names().contains(&name)
    }

    /// Load pool state from disk. A missing file initializes empty state;
    /// loaded theme and custom names override the constructor's.
    pub fn load(&mut self) -> anyhow::Result<()> {
        let data = match std::fs::read_to_string(&self.state_file) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.in_use.clear();
                self.overflow_next = self.max_size + 1;
                return Ok(());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", self.state_file.display())));
            }
        };

        let loaded: PoolState = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", self.state_file.display()))?;

        if !loaded.theme.is_empty() {
            self.theme = loaded.theme;
        }
        if !loaded.custom_names.is_empty() {
            self.custom_names = loaded.custom_names;
        }
        if loaded.max_size > 0 {
            self.max_size = loaded.max_size;
        }
        self.in_use = loaded.in_use;
        self.overflow_next = loaded.overflow_next.max(self.max_size + 1);

        Ok(())
    }

    /// Persist pool state to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = self
            .state_file
            .parent()
            .ok_or_else(|| anyhow::anyhow!("state file has no parent dir"))?;
        std::fs::create_dir_all(dir).context("creating .runtime dir")?;

        let state = PoolState {
            rig_name: self.rig_name.clone(),
            theme: self.theme.clone(),
            custom_names: self.custom_names.clone(),
            in_use: self.in_use.clone(),
            overflow_next: self.overflow_next,
            max_size: self.max_size,
        };
        let data = serde_json::to_string_pretty(&state)?;
        std::fs::write(&self.state_file, data)
            .with_context(|| format!("writing {}", self.state_file.display()))
    }

    /// Allocate a name: the earliest-declared free themed name, or an
    /// overflow name once the first `max_size` slots are all in use.
    pub fn allocate(&mut self) -> String {
        let candidates: Vec<String> = self
            .names()
            .iter()
            .take(self.max_size)
            .map(|s| s.to_string())
            .collect();
        for name in candidates {
            if !self.in_use.get(&name).copied().unwrap_or(false) {
                self.in_use.insert(name.clone(), true);
                return name;
            }
        }

        let name = format!("{}-{}", self.rig_name, self.overflow_next);
        self.overflow_next += 1;
        name
    }

    /// Return a themed name to the pool. Overflow and unknown names are
    /// not tracked, so releasing them is a no-op.
    pub fn release(&mut self, name: &str) {
        if self.is_themed_name(name) {
            self.in_use.remove(name);
        }
    }

    /// Mark a themed name as in use (for reconciling with existing
    /// workers).
    pub fn mark_in_use(&mut self, name: &str) {
        if self.is_themed_name(name) {
            self.in_use.insert(name.to_string(), true);
        }
    }

    /// Rebuild the in-use set from the filesystem's worker listing,
    /// dropping stale claims. Non-themed names are ignored.
    pub fn reconcile(&mut self, existing: &[String]) {
        self.in_use.clear();
        for name in existing {
            if self.is_themed_name(name) {
                self.in_use.insert(name.clone(), true);
            }
        }
    }

    /// True if the name belongs to the pool's themed list.
    pub fn is_pool_name(&self, name: &str) -> bool {
        self.is_themed_name(name)
    }

    /// Number of pool names currently in use.
    pub fn active_count(&self) -> usize {
        self.in_use.len()
    }

    /// Sorted list of pool names currently in use.
    pub fn active_names(&self) -> Vec<String> {
        self.in_use.keys().cloned().collect()
    }

    /// Current theme name.
    pub fn theme(&self) -> &str {
        &self.theme
    }

    /// Switch themes, preserving in-use names present in both themes.
    /// Names missing from the new theme are silently dropped (the workers
    /// keep running; they just stop counting against the quota).
    pub fn set_theme(&mut self, theme: &str) -> anyhow::Result<()> {
        if theme == self.theme {
            return Ok(());
        }
        let Some(new_names) = builtin_theme(theme) else {
            anyhow::bail!(
                "unknown theme: {theme} (available: {})",
                list_themes().join(", ")
            );
        };

        let preserved: BTreeMap<String, bool> = self
            .in_use
            .keys()
            .filter(|name| new_names.contains(&name.as_str()))
            .map(|name| (name.clone(), true))
            .collect();

        self.theme = theme.to_string();
        self.in_use = preserved;
        self.custom_names.clear();
        Ok(())
    }

    /// Add a custom name to the pool's list (deduplicated).
    pub fn add_custom_name(&mut self, name: &str) {
        if !self.custom_names.iter().any(|n| n == name) {
            self.custom_names.push(name.to_string());
        }
    }

    /// Clear the pool, releasing all names and resetting overflow.
    pub fn reset(&mut self) {
        self.in_use.clear();
        self.overflow_next = self.max_size + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pool() -> (tempfile::TempDir, NamePool) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = NamePool::new(tmp.path(), "testrig");
        (tmp, pool)
    }

    #[test]
    fn allocates_in_theme_order() {
        let (_tmp, mut pool) = fresh_pool();
        assert_eq!(pool.allocate(), "furiosa");
        assert_eq!(pool.allocate(), "nux");
        assert_eq!(pool.allocate(), "slit");
    }

    #[test]
    fn released_name_is_reused() {
        let (_tmp, mut pool) = fresh_pool();
        pool.allocate(); // furiosa
        pool.allocate(); // nux
        pool.allocate(); // slit
        pool.release("nux");
        // Earliest-declared free slot wins, not rictus
        assert_eq!(pool.allocate(), "nux");
    }

    #[test]
    fn prefers_theme_order_over_release_order() {
        let (_tmp, mut pool) = fresh_pool();
        for _ in 0..5 {
            pool.allocate();
        }
        pool.release("slit");
        pool.release("furiosa");
        assert_eq!(pool.allocate(), "furiosa");
        assert_eq!(pool.allocate(), "slit");
    }

    #[test]
    fn overflow_after_exhaustion() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = NamePool::with_config(tmp.path(), "gastown", "mad-max", &[], 5);
        for _ in 0..5 {
            pool.allocate();
        }
        assert_eq!(pool.allocate(), "gastown-6");
        assert_eq!(pool.allocate(), "gastown-7");
    }

    #[test]
    fn overflow_names_are_not_reusable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = NamePool::with_config(tmp.path(), "gastown", "mad-max", &[], 3);
        for _ in 0..3 {
            pool.allocate();
        }
        let overflow = pool.allocate();
        assert_eq!(overflow, "gastown-4");
        pool.release(&overflow);
        // The counter does not rewind
        assert_eq!(pool.allocate(), "gastown-5");
    }

    #[test]
    fn release_of_unknown_name_is_noop() {
        let (_tmp, mut pool) = fresh_pool();
        pool.allocate();
        pool.release("not-a-theme-name");
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = NamePool::new(tmp.path(), "testrig");
        pool.allocate(); // furiosa
        pool.allocate(); // nux
        pool.allocate(); // slit
        pool.release("nux");
        pool.save().unwrap();

        let mut pool2 = NamePool::new(tmp.path(), "testrig");
        pool2.load().unwrap();
        assert_eq!(pool2.active_count(), 2);
        assert_eq!(pool2.active_names(), vec!["furiosa", "slit"]);
        // The released slot is the next allocation
        assert_eq!(pool2.allocate(), "nux");
    }

    #[test]
    fn load_missing_file_initializes_empty() {
        let (_tmp, mut pool) = fresh_pool();
        pool.load().unwrap();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.allocate(), "furiosa");
    }

    #[test]
    fn load_clamps_overflow_counter() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".runtime")).unwrap();
        std::fs::write(
            tmp.path().join(".runtime/namepool-state.json"),
            r#"{"rig_name": "testrig", "theme": "mad-max", "in_use": {}, "overflow_next": 3, "max_size": 50}"#,
        )
        .unwrap();

        let mut pool = NamePool::new(tmp.path(), "testrig");
        pool.load().unwrap();
        // overflow_next below max_size+1 is nonsense from an older file
        for _ in 0..50 {
            pool.allocate();
        }
        assert_eq!(pool.allocate(), "testrig-51");
    }

    #[test]
    fn reconcile_drops_stale_and_ignores_foreign_names() {
        let (_tmp, mut pool) = fresh_pool();
        pool.allocate();
        pool.allocate();

        pool.reconcile(&[
            "slit".to_string(),
            "valkyrie".to_string(),
            "some-other-name".to_string(),
        ]);
        assert_eq!(pool.active_count(), 2);
        // furiosa was dropped by reconcile, so it is first again
        assert_eq!(pool.allocate(), "furiosa");
    }

    #[test]
    fn is_pool_name_only_matches_theme() {
        let (_tmp, pool) = fresh_pool();
        assert!(pool.is_pool_name("furiosa"));
        assert!(pool.is_pool_name("max"));
        assert!(!pool.is_pool_name("testrig-51"));
        assert!(!pool.is_pool_name("random-name"));
    }

    #[test]
    fn set_theme_preserves_intersection() {
        let (_tmp, mut pool) = fresh_pool();
        pool.allocate(); // furiosa
        pool.mark_in_use("chrome"); // present in both mad-max and wasteland

        pool.set_theme("wasteland").unwrap();
        assert_eq!(pool.theme(), "wasteland");
        // furiosa is not a wasteland name and was dropped
        assert_eq!(pool.active_names(), vec!["chrome"]);
    }

    #[test]
    fn set_theme_same_theme_is_noop() {
        let (_tmp, mut pool) = fresh_pool();
        pool.allocate();
        pool.set_theme("mad-max").unwrap();
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn set_theme_unknown_is_error() {
        let (_tmp, mut pool) = fresh_pool();
        assert!(pool.set_theme("cyberpunk").is_err());
    }

    #[test]
    fn custom_names_take_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        let names = vec!["alpha".to_string(), "bravo".to_string()];
        let mut pool = NamePool::with_config(tmp.path(), "testrig", "mad-max", &names, 2);
        assert_eq!(pool.allocate(), "alpha");
        assert_eq!(pool.allocate(), "bravo");
        assert_eq!(pool.allocate(), "testrig-3");
    }

    #[test]
    fn add_custom_name_extends_and_dedupes() {
        let tmp = tempfile::tempdir().unwrap();
        let names = vec!["alpha".to_string()];
        let mut pool = NamePool::with_config(tmp.path(), "testrig", "mad-max", &names, 3);
        pool.add_custom_name("bravo");
        pool.add_custom_name("bravo");

        assert_eq!(pool.allocate(), "alpha");
        assert_eq!(pool.allocate(), "bravo");
        // The duplicate was not added twice
        assert_eq!(pool.allocate(), "testrig-4");
    }

    #[test]
    fn reset_clears_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = NamePool::with_config(tmp.path(), "testrig", "mad-max", &[], 2);
        pool.allocate();
        pool.allocate();
        pool.allocate(); // overflow
        pool.reset();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.allocate(), "furiosa");
        pool.reset();
        // Overflow counter rewinds on reset
        pool.allocate();
        pool.allocate();
        assert_eq!(pool.allocate(), "testrig-3");
    }
}
