//! Configuration for bizimatch.
//!
//! Settings are read from `bizimatch.toml` (default `.bizimatch/bizimatch.toml`),
//! then overlaid with environment variables, then with CLI flags.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! dev_mode = false
//! db_path = ".bizimatch/runs.db"
//!
//! [pipeline]
//! max_retries = 3
//! backoff_base_ms = 2000
//! backoff_max_ms = 60000
//! rollback_stage = "code_generation"
//! max_rollbacks = 1
//! approval_timeout_secs = 86400
//! skip_stages = ["testing"]
//!
//! [orchestrator]
//! max_concurrent_runs = 4
//! persistence_retries = 3
//!
//! [ai]
//! model = "claude-3-sonnet-20240229"
//! max_tokens = 4000
//! timeout_secs = 120
//!
//! [generation]
//! language = "python"
//!
//! [testing]
//! command = "pytest -q"
//! timeout_secs = 600
//!
//! [deploy]
//! output_dir = ".bizimatch/deployments"
//! ```
//!
//! Environment: `ANTHROPIC_API_KEY`, `HOST`, `PORT`, `DEBUG`,
//! `BIZIMATCH_DB_PATH`. A `.env` file is loaded first when present.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::models::StageName;

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for local front-end development
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".bizimatch/runs.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            db_path: default_db_path(),
        }
    }
}

/// Per-run policy. A copy is frozen into every run at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries after the first failed attempt of a stage
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Stage to re-enter when a review is rejected. `None` fails the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_stage: Option<StageName>,
    #[serde(default = "default_max_rollbacks")]
    pub max_rollbacks: u32,
    /// How long a run may wait at the review gate. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,
    /// Stages recorded as skipped without invoking their executor
    #[serde(default)]
    pub skip_stages: Vec<StageName>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_rollbacks() -> u32 {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            rollback_stage: None,
            max_rollbacks: default_max_rollbacks(),
            approval_timeout_secs: None,
            skip_stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn is_skipped(&self, stage: StageName) -> bool {
        self.skip_stages.contains(&stage)
    }
}

/// Per-run overrides accepted by `POST /runs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineOverrides {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    #[serde(default)]
    pub rollback_stage: Option<StageName>,
    #[serde(default)]
    pub max_rollbacks: Option<u32>,
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_stages: Option<Vec<StageName>>,
}

impl PipelineOverrides {
    /// Merge onto `base`, producing the snapshot frozen into a new run.
    pub fn apply(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut config = base.clone();
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.backoff_base_ms {
            config.backoff_base_ms = v;
        }
        if let Some(v) = self.backoff_max_ms {
            config.backoff_max_ms = v;
        }
        if let Some(v) = self.rollback_stage {
            config.rollback_stage = Some(v);
        }
        if let Some(v) = self.max_rollbacks {
            config.max_rollbacks = v;
        }
        if let Some(v) = self.approval_timeout_secs {
            config.approval_timeout_secs = Some(v);
        }
        if let Some(ref v) = self.skip_stages {
            config.skip_stages = v.clone();
        }
        config
    }
}

/// Process-wide orchestrator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Runs driven concurrently; further runs wait for a slot
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Retries of a failed state write before the run is given up on
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,
    #[serde(default = "default_persistence_backoff_ms")]
    pub persistence_backoff_ms: u64,
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_persistence_retries() -> u32 {
    3
}

fn default_persistence_backoff_ms() -> u64 {
    100
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            persistence_retries: default_persistence_retries(),
            persistence_backoff_ms: default_persistence_backoff_ms(),
        }
    }
}

/// AI text-generation service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSection {
    /// Prefer `ANTHROPIC_API_KEY`; a key in the file is used as fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    "claude-3-sonnet-20240229".to_string()
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_ai_timeout_secs() -> u64 {
    120
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

impl Default for AiSection {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_ai_timeout_secs(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "python".to_string()
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestingSection {
    /// Shell command run against the generated code. Unset skips the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

fn default_test_timeout_secs() -> u64 {
    600
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".bizimatch/workspaces")
}

impl Default for TestingSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_test_timeout_secs(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".bizimatch/deployments")
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Contents of `bizimatch.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BizimatchToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub ai: AiSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub testing: TestingSection,
    #[serde(default)]
    pub deploy: DeploySection,
}

impl BizimatchToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bizimatch.toml")
    }

    /// Load from `path`, or defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize bizimatch.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.ai.api_key = Some(key);
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT '{}'", port))?;
        }
        if let Some(debug) = lookup("DEBUG") {
            self.server.dev_mode = debug.eq_ignore_ascii_case("true");
        }
        if let Some(db_path) = lookup("BIZIMATCH_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        Ok(())
    }

    /// Overlay the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_concurrent_runs == 0 {
            warnings.push("orchestrator.max_concurrent_runs is 0; treating it as 1".to_string());
        }
        if self.pipeline.backoff_base_ms > self.pipeline.backoff_max_ms {
            warnings.push(format!(
                "pipeline.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.pipeline.backoff_base_ms, self.pipeline.backoff_max_ms
            ));
        }
        if let Some(stage) = self.pipeline.rollback_stage
            && stage >= StageName::Review
        {
            warnings.push(format!(
                "pipeline.rollback_stage '{}' must precede the review stage",
                stage
            ));
        }
        if self.pipeline.is_skipped(StageName::Review) {
            warnings.push("pipeline.skip_stages contains 'review': runs will deploy without approval".to_string());
        }
        if self.ai.api_key.is_none() {
            warnings.push("No AI API key configured (set ANTHROPIC_API_KEY)".to_string());
        }
        if self.ai.max_tokens == 0 {
            warnings.push("ai.max_tokens is 0".to_string());
        }

        warnings
    }
}

/// Resolved configuration: file, then environment, then CLI overrides.
#[derive(Debug, Clone)]
pub struct BizimatchConfig {
    pub config_path: PathBuf,
    pub toml: BizimatchToml,
    pub verbose: bool,
}

impl BizimatchConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from(".bizimatch").join("bizimatch.toml")
    }

    /// Load the file at `config_path` (defaults if missing) and overlay the environment.
    pub fn load(config_path: PathBuf) -> Result<Self> {
        let mut toml = BizimatchToml::load_or_default(&config_path)?;
        toml.apply_env()?;
        Ok(Self {
            config_path,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(
        config_path: Option<PathBuf>,
        verbose: bool,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path.unwrap_or_else(Self::default_path))?;
        config.verbose = verbose;
        if let Some(db_path) = db_path {
            config.toml.server.db_path = db_path;
        }
        Ok(config)
    }

    pub fn db_path(&self) -> &Path {
        &self.toml.server.db_path
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
