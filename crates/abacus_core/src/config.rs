use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Service configuration stored at `~/.abacus/config.json`.
///
/// Every learning constant lives here rather than in code: the decay
/// schedule, reward weights, and confidence scaling are tunable knobs, not
/// behavior the rest of the system is allowed to assume exact values for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbacusConfig {
    // Q-learning
    pub learning_rate: f64,
    pub discount_factor: f64,

    // Exploration
    pub exploration_rate: f64,
    pub exploration_decay: f64,
    pub min_exploration_rate: f64,
    pub min_samples: u32,
    pub ucb_constant: f64,
    pub recommendation_limit: usize,

    // Experience replay
    pub replay_capacity: usize,
    pub replay_batch_size: usize,
    pub replay_priority_exponent: f64,

    // Reward shaping
    pub success_reward: f64,
    pub failure_penalty: f64,
    pub latency_threshold_ms: u64,
    pub latency_penalty_per_second: f64,
    pub latency_penalty_cap: f64,
    pub reward_clamp: f64,

    // Observability
    pub metrics_capacity: usize,

    // Sessions
    pub session_grace_secs: i64,

    // Feedback ledger
    pub feedback_enabled: bool,

    // General
    pub log_level: String,
}

impl Default for AbacusConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.1,
            exploration_decay: 0.995,
            min_exploration_rate: 0.01,
            min_samples: 5,
            ucb_constant: 2.0,
            recommendation_limit: 5,
            replay_capacity: 10_000,
            replay_batch_size: 32,
            replay_priority_exponent: 0.6,
            success_reward: 1.0,
            failure_penalty: 1.0,
            latency_threshold_ms: 1000,
            latency_penalty_per_second: 0.1,
            latency_penalty_cap: 0.5,
            reward_clamp: 2.0,
            metrics_capacity: 512,
            session_grace_secs: 3600,
            feedback_enabled: true,
            log_level: "info".into(),
        }
    }
}

impl AbacusConfig {
    /// Returns the base config directory: `~/.abacus/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".abacus"))
    }

    /// Returns the config file path: `~/.abacus/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.abacus/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the database path: `~/.abacus/feedback.db`
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("feedback.db"))
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs() -> Result<()> {
        let dirs = [Self::base_dir()?, Self::logs_dir()?];
        for dir in &dirs {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates default if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Saves config to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to_path(&path)
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

/// Shared, thread-safe access to the live configuration.
pub struct ConfigManager {
    config: Arc<RwLock<AbacusConfig>>,
}

impl ConfigManager {
    /// Load the configuration from the default location.
    pub fn new() -> Result<Self> {
        let config = AbacusConfig::load()?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
        })
    }

    /// Wrap an already-built configuration (tests, embedded use).
    pub fn from_config(config: AbacusConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Returns a snapshot of the current configuration.
    pub fn get(&self) -> AbacusConfig {
        self.config.read().clone()
    }

    /// Apply a mutation and persist the result.
    pub fn update(&self, f: impl FnOnce(&mut AbacusConfig)) -> Result<()> {
        let mut config = self.config.write();
        f(&mut config);
        config.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = AbacusConfig::default();
        assert!((config.learning_rate - 0.1).abs() < f64::EPSILON);
        assert!((config.discount_factor - 0.9).abs() < f64::EPSILON);
        assert!((config.exploration_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.min_samples, 5);
        assert_eq!(config.replay_capacity, 10_000);
        assert!(config.feedback_enabled);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let path = tmp.path().join("config.json");

        let mut config = AbacusConfig::default();
        config.learning_rate = 0.25;
        config.feedback_enabled = false;
        config.save_to_path(&path).unwrap();

        let loaded = AbacusConfig::load_from_path(&path).unwrap();
        assert!((loaded.learning_rate - 0.25).abs() < f64::EPSILON);
        assert!(!loaded.feedback_enabled);
    }

    #[test]
    fn test_load_missing_creates_default() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let path = tmp.path().join("config.json");
        assert!(!path.exists());

        let loaded = AbacusConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert!((loaded.exploration_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        // A config file with only some fields should fill the rest from
        // defaults via #[serde(default)].
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"learning_rate": 0.5}"#).unwrap();

        let loaded = AbacusConfig::load_from_path(&path).unwrap();
        assert!((loaded.learning_rate - 0.5).abs() < f64::EPSILON);
        assert!((loaded.discount_factor - 0.9).abs() < f64::EPSILON);
        assert_eq!(loaded.min_samples, 5);
    }

    #[test]
    fn test_config_manager_snapshot() {
        let manager = ConfigManager::from_config(AbacusConfig {
            exploration_rate: 0.2,
            ..AbacusConfig::default()
        });
        assert!((manager.get().exploration_rate - 0.2).abs() < f64::EPSILON);
    }
}
