//! Server configuration from environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use threadline_core::{AgentConfig, GenerationOptions, MemoryConfig};

/// Runtime settings, read once at startup
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Thread files go here; `None` keeps conversations in memory only
    pub data_dir: Option<PathBuf>,

    /// Allowed browser origin; any origin when unset
    pub cors_origin: Option<String>,

    pub model: String,
    pub summary_model: String,
    pub max_iterations: usize,
    pub context_window: usize,
    pub compaction_period: usize,
    pub summary_window: usize,
    pub model_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let agent = AgentConfig::default();
        let memory = MemoryConfig::default();
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            data_dir: None,
            cors_origin: None,
            model: agent.generation.model.clone(),
            summary_model: agent.generation.model,
            max_iterations: agent.max_iterations,
            context_window: memory.short_term_window,
            compaction_period: memory.compaction_period,
            summary_window: memory.summary_window,
            model_timeout: agent.model_timeout,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let model = std::env::var("LLM_MODEL").unwrap_or(defaults.model);

        let config = Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            data_dir: std::env::var("DATA_DIR").ok().map(PathBuf::from),
            cors_origin: std::env::var("CORS_ORIGIN").ok().filter(|o| !o.is_empty()),
            summary_model: std::env::var("SUMMARY_MODEL").unwrap_or_else(|_| model.clone()),
            model,
            max_iterations: parse_var("MAX_ITERATIONS", defaults.max_iterations)?,
            context_window: parse_var("CONTEXT_WINDOW", defaults.context_window)?,
            compaction_period: parse_var("COMPACTION_PERIOD", defaults.compaction_period)?,
            summary_window: parse_var("SUMMARY_WINDOW", defaults.summary_window)?,
            model_timeout: Duration::from_secs(parse_var(
                "MODEL_TIMEOUT_SECS",
                defaults.model_timeout.as_secs(),
            )?),
        };

        anyhow::ensure!(config.max_iterations > 0, "MAX_ITERATIONS must be at least 1");
        Ok(config)
    }

    pub fn agent_config(&self) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            max_iterations: self.max_iterations,
            generation: GenerationOptions {
                model: self.model.clone(),
                ..defaults.generation
            },
            model_timeout: self.model_timeout,
            ..defaults
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        let defaults = MemoryConfig::default();
        MemoryConfig {
            short_term_window: self.context_window,
            compaction_period: self.compaction_period,
            summary_window: self.summary_window,
            summary_options: GenerationOptions {
                model: self.summary_model.clone(),
                ..defaults.summary_options
            },
            summary_timeout: self.model_timeout,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}
