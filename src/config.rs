use std::path::Path;

use thiserror::Error;

use crate::design::{DesignError, ExperimentDesign};
use crate::record::ParticipantId;
use crate::retry::RetryConfig;
use crate::rng::{fresh_seed, participant_seed};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read design file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse design file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid design: {0}")]
    Design(#[from] DesignError),
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub design: ExperimentDesign,
    /// When set, each participant's session seed derives from it.
    pub base_seed: Option<u64>,
    pub results_csv: String,
    pub questionnaire_csv: String,
    pub debrief_dir: String,
    pub archive_path: String,
    pub remote_url: Option<String>,
    pub remote_secret: Option<String>,
    pub remote_retry: RetryConfig,
    /// Consecutive remote failures before batches are skipped.
    pub remote_breaker_threshold: u32,
    /// Batches skipped while the breaker is open before probing again.
    pub remote_breaker_cooldown: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            design: ExperimentDesign::default(),
            base_seed: None,
            results_csv: "experiment_data_all.csv".to_string(),
            questionnaire_csv: "questionnaire_data_all.csv".to_string(),
            debrief_dir: ".".to_string(),
            archive_path: "experiment_sessions.sqlite".to_string(),
            remote_url: None,
            remote_secret: None,
            remote_retry: RetryConfig::default(),
            remote_breaker_threshold: 3,
            remote_breaker_cooldown: 5,
        }
    }
}

impl ExperimentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut design = match std::env::var("DESIGN_PATH") {
            Ok(path) => load_design(Path::new(&path))?,
            Err(_) => defaults.design.clone(),
        };
        design.rounds_per_phase = std::env::var("ROUNDS_PER_PHASE").ok().and_then(|v| v.parse().ok()).unwrap_or(design.rounds_per_phase);
        design.rewards.red = std::env::var("REWARD_RED").ok().and_then(|v| v.parse().ok()).unwrap_or(design.rewards.red);
        design.rewards.black = std::env::var("REWARD_BLACK").ok().and_then(|v| v.parse().ok()).unwrap_or(design.rewards.black);
        design.rewards.gold = std::env::var("REWARD_GOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(design.rewards.gold);
        design.rewards.silver = std::env::var("REWARD_SILVER").ok().and_then(|v| v.parse().ok()).unwrap_or(design.rewards.silver);
        design.validate()?;

        let mut remote_retry = RetryConfig::default();
        remote_retry.max_retries = std::env::var("REMOTE_MAX_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(remote_retry.max_retries);
        remote_retry.base_delay_ms = std::env::var("REMOTE_BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(remote_retry.base_delay_ms);

        Ok(Self {
            design,
            base_seed: std::env::var("EXPERIMENT_SEED").ok().and_then(|v| v.parse().ok()),
            results_csv: std::env::var("RESULTS_CSV").unwrap_or(defaults.results_csv),
            questionnaire_csv: std::env::var("QUESTIONNAIRE_CSV").unwrap_or(defaults.questionnaire_csv),
            debrief_dir: std::env::var("DEBRIEF_DIR").unwrap_or(defaults.debrief_dir),
            archive_path: std::env::var("ARCHIVE_PATH").unwrap_or(defaults.archive_path),
            remote_url: std::env::var("REMOTE_URL").ok().filter(|v| !v.trim().is_empty()),
            remote_secret: std::env::var("REMOTE_SECRET").ok().filter(|v| !v.is_empty()),
            remote_retry,
            remote_breaker_threshold: std::env::var("REMOTE_BREAKER_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.remote_breaker_threshold),
            remote_breaker_cooldown: std::env::var("REMOTE_BREAKER_COOLDOWN").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.remote_breaker_cooldown),
        })
    }

    /// Seed for a new session: pinned per participant when a base seed is
    /// configured, otherwise fresh entropy (recorded by the session).
    pub fn session_seed(&self, participant_id: &ParticipantId) -> u64 {
        match self.base_seed {
            Some(base) => participant_seed(base, participant_id.as_str()),
            None => fresh_seed(),
        }
    }
}

pub fn load_design(path: &Path) -> Result<ExperimentDesign, ConfigError> {
    let display = path.to_string_lossy().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    let design: ExperimentDesign = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: display,
        source,
    })?;
    design.validate()?;
    Ok(design)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Phase;

    #[test]
    fn test_pinned_seed_is_per_participant() {
        let cfg = ExperimentConfig {
            base_seed: Some(2024),
            ..Default::default()
        };
        let a = ParticipantId::parse("1").unwrap();
        let b = ParticipantId::parse("2").unwrap();
        assert_eq!(cfg.session_seed(&a), cfg.session_seed(&a));
        assert_ne!(cfg.session_seed(&a), cfg.session_seed(&b));
    }

    #[test]
    fn test_load_design_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("design.json");
        let mut design = ExperimentDesign::default();
        design.phase_mut(Phase::Two).p_uncertain = 0.35;
        std::fs::write(&path, serde_json::to_string_pretty(&design).unwrap()).unwrap();
        let loaded = load_design(&path).unwrap();
        assert_eq!(loaded.phase(Phase::Two).p_uncertain, 0.35);
    }

    #[test]
    fn test_load_design_rejects_invalid_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("design.json");
        let mut design = ExperimentDesign::default();
        design.phase_mut(Phase::One).silver_odds = 0.2;
        std::fs::write(&path, serde_json::to_string(&design).unwrap()).unwrap();
        assert!(matches!(load_design(&path), Err(ConfigError::Design(_))));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_design(&path), Err(ConfigError::Json { .. })));
        assert!(matches!(
            load_design(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
