//! Rig settings, merge-queue configuration, and the town agent registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Typed configuration failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("unsupported config version: {0}")]
    InvalidVersion(u32),

    #[error("invalid config type: {0}")]
    InvalidType(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid on_conflict strategy {0:?} (only \"assign_back\" is supported)")]
    InvalidOnConflictStrategy(String),
}

/// Merge queue section of `<rig>/config.json`.
///
/// All fields are optional in the file; missing fields keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MergeQueueConfig {
    /// Whether the merge queue is active for this rig.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Branch merges land on. Empty means the rig's default branch.
    #[serde(default)]
    pub target_branch: String,

    /// Per-epic integration branches.
    #[serde(default = "default_true")]
    pub integration_branches: bool,

    /// Conflict strategy. Only "assign_back" is implemented; "auto_rebase"
    /// is rejected at load.
    #[serde(default = "default_on_conflict")]
    pub on_conflict: String,

    /// Run the test command before merging.
    #[serde(default = "default_true")]
    pub run_tests: bool,

    /// Shell command to validate the tree. Empty disables validation.
    #[serde(default)]
    pub test_command: String,

    /// Delete local and remote source branches after a merge.
    #[serde(default = "default_true")]
    pub delete_merged_branches: bool,

    /// Extra attempts for a failing test command.
    #[serde(default = "default_retry_flaky")]
    pub retry_flaky_tests: u32,

    /// How often the engine polls the queue, e.g. "30s", "2m".
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Merge workers per rig. The design depends on this staying 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_true() -> bool {
    true
}
fn default_on_conflict() -> String {
    "assign_back".to_string()
}
fn default_retry_flaky() -> u32 {
    1
}
fn default_poll_interval() -> String {
    "30s".to_string()
}
fn default_max_concurrent() -> u32 {
    1
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl MergeQueueConfig {
    /// Load the `merge_queue` section from a rig's config.json.
    ///
    /// A missing file or missing section yields defaults. An unknown
    /// on_conflict strategy or unparsable poll_interval is an error.
    pub fn load(rig_config_path: &Path) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct RigConfigFile {
            #[serde(default)]
            merge_queue: Option<MergeQueueConfig>,
        }

        let config = match std::fs::read_to_string(rig_config_path) {
            Ok(data) => {
                let parsed: RigConfigFile = serde_json::from_str(&data)
                    .with_context(|| format!("parsing {}", rig_config_path.display()))?;
                parsed.merge_queue.unwrap_or_default()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", rig_config_path.display())));
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.on_conflict != "assign_back" {
            return Err(ConfigError::InvalidOnConflictStrategy(
                self.on_conflict.clone(),
            ));
        }
        Ok(())
    }

    /// Parsed poll interval.
    pub fn poll_interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.poll_interval)
            .with_context(|| format!("invalid poll_interval {:?}", self.poll_interval))
    }
}

/// Parse a duration string of the form "30s", "5m", "1h", or bare seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value.parse().context("duration value")?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => anyhow::bail!("unknown duration unit {other:?}"),
    };
    Ok(Duration::from_secs(secs))
}

/// Namepool section of `<rig>/settings/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamepoolSettings {
    /// Theme name (e.g. "mad-max", "minerals").
    #[serde(default)]
    pub style: String,

    /// Custom names overriding the theme list.
    #[serde(default)]
    pub names: Vec<String>,

    /// Pool size before overflow numbering kicks in.
    #[serde(default)]
    pub max_before_numbering: usize,
}

/// Rig settings file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigSettings {
    #[serde(default)]
    pub namepool: Option<NamepoolSettings>,
}

impl RigSettings {
    /// Load rig settings; a missing file is an empty settings object.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("reading {}", path.display()))),
        }
    }
}

/// Current schema version of the agent registry.
pub const AGENT_REGISTRY_VERSION: u32 = 1;

/// One runtime preset in the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreset {
    /// CLI binary to invoke.
    pub command: String,

    /// Default arguments for autonomous mode.
    #[serde(default)]
    pub args: Vec<String>,

    /// Flag or subcommand for resuming a session.
    #[serde(default)]
    pub resume_flag: Option<String>,

    /// "flag" or "subcommand".
    #[serde(default)]
    pub resume_style: Option<String>,
}

/// Town-level agent registry (`settings/agents.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistry {
    pub version: u32,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentPreset>,
}

impl AgentRegistry {
    /// Built-in presets used when the town has no registry file.
    pub fn builtin() -> Self {
        let mut agents = BTreeMap::new();
        agents.insert(
            "claude".to_string(),
            AgentPreset {
                command: "claude".to_string(),
                args: vec!["--dangerously-skip-permissions".to_string()],
                resume_flag: Some("--resume".to_string()),
                resume_style: Some("flag".to_string()),
            },
        );
        Self {
            version: AGENT_REGISTRY_VERSION,
            agents,
        }
    }

    /// Load the registry from `<town>/settings/agents.json`.
    ///
    /// Missing file falls back to built-ins; an unsupported version is an
    /// error.
    pub fn load(town_root: &Path) -> anyhow::Result<Self> {
        let path = town_root.join("settings").join("agents.json");
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::builtin()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", path.display())));
            }
        };

        let registry: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        if registry.version != AGENT_REGISTRY_VERSION {
            return Err(ConfigError::InvalidVersion(registry.version).into());
        }
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for preset in self.agents.values() {
            if preset.command.is_empty() {
                return Err(ConfigError::MissingField("command"));
            }
            if let Some(ref style) = preset.resume_style
                && style != "flag"
                && style != "subcommand"
            {
                return Err(ConfigError::InvalidType(format!(
                    "resume_style must be \"flag\" or \"subcommand\", got {style:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_queue_defaults() {
        let config = MergeQueueConfig::default();
        assert!(config.enabled);
        assert_eq!(config.on_conflict, "assign_back");
        assert!(config.run_tests);
        assert_eq!(config.test_command, "");
        assert!(config.delete_merged_branches);
        assert_eq!(config.retry_flaky_tests, 1);
        assert_eq!(config.poll_interval, "30s");
        assert_eq!(config.max_concurrent, 1);
    }

    #[test]
    fn merge_queue_partial_section() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"merge_queue": {"test_command": "cargo test", "poll_interval": "2m"}}"#,
        )
        .unwrap();

        let config = MergeQueueConfig::load(&path).unwrap();
        assert_eq!(config.test_command, "cargo test");
        assert_eq!(
            config.poll_interval().unwrap(),
            Duration::from_secs(120)
        );
        // Untouched fields keep defaults
        assert!(config.enabled);
        assert_eq!(config.retry_flaky_tests, 1);
    }

    #[test]
    fn merge_queue_missing_file_is_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MergeQueueConfig::load(&tmp.path().join("config.json")).unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn auto_rebase_rejected_at_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"merge_queue": {"on_conflict": "auto_rebase"}}"#).unwrap();

        let err = MergeQueueConfig::load(&path).unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(
            config_err,
            ConfigError::InvalidOnConflictStrategy(_)
        ));
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn rig_settings_namepool_section() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"namepool": {"style": "minerals", "max_before_numbering": 10}}"#,
        )
        .unwrap();

        let settings = RigSettings::load(&path).unwrap();
        let pool = settings.namepool.unwrap();
        assert_eq!(pool.style, "minerals");
        assert_eq!(pool.max_before_numbering, 10);
        assert!(pool.names.is_empty());
    }

    #[test]
    fn agent_registry_missing_file_uses_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::load(tmp.path()).unwrap();
        assert!(registry.agents.contains_key("claude"));
    }

    #[test]
    fn agent_registry_validates_presets() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("settings")).unwrap();
        std::fs::write(
            tmp.path().join("settings/agents.json"),
            r#"{"version": 1, "agents": {"broken": {"command": ""}}}"#,
        )
        .unwrap();

        let err = AgentRegistry::load(tmp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingField("command"))
        ));

        std::fs::write(
            tmp.path().join("settings/agents.json"),
            r#"{"version": 1, "agents": {"odd": {"command": "x", "resume_style": "magic"}}}"#,
        )
        .unwrap();
        let err = AgentRegistry::load(tmp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidType(_))
        ));
    }

    #[test]
    fn agent_registry_rejects_unknown_version() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("settings")).unwrap();
        std::fs::write(
            tmp.path().join("settings/agents.json"),
            r#"{"version": 99, "agents": {}}"#,
        )
        .unwrap();

        let err = AgentRegistry::load(tmp.path()).unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(config_err, ConfigError::InvalidVersion(99)));
    }
}
