use std::path::PathBuf;

use serde::Serialize;

/// Application-level constants
pub const APP_NAME: &str = "TaskAudit";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.1:8b";
const DEFAULT_VISION_MODEL: &str = "llama3.2-vision";
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Upper bound on reflection rounds, whatever the environment asks for.
pub const MAX_REFLECTION_ITERATIONS: u32 = 5;

/// Get the application data directory.
/// ~/TaskAudit/ on all platforms, falling back to the working directory when
/// no home directory can be resolved.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the SQLite checkpoint database.
pub fn default_checkpoint_db() -> PathBuf {
    app_data_dir().join("checkpoints.db")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,taskaudit_lib=info,reqwest=warn"
}

/// Stage toggles for the audit pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOptions {
    /// Run the single up-front relevance classification.
    pub relevance_gate: bool,
    /// Run the bounded reflection loop after execution.
    pub reflection: bool,
    /// Hard ceiling on reflection rounds (1..=5).
    pub max_iterations: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            relevance_gate: true,
            reflection: false,
            max_iterations: MAX_REFLECTION_ITERATIONS,
        }
    }
}

/// Process-wide configuration, constructed once and passed by reference
/// into the run driver.
#[derive(Debug, Clone, Serialize)]
pub struct AuditorConfig {
    pub ollama_url: String,
    pub model: String,
    pub vision_model: String,
    pub timeout_secs: u64,
    /// `None` disables checkpointing entirely.
    pub checkpoint_db: Option<PathBuf>,
    /// `None` disables diagnostic dumps.
    pub dump_dir: Option<PathBuf>,
    pub pipeline: PipelineOptions,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            checkpoint_db: Some(default_checkpoint_db()),
            dump_dir: None,
            pipeline: PipelineOptions::default(),
        }
    }
}

impl AuditorConfig {
    /// Build the configuration from `TASKAUDIT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let checkpoint_db = match get("TASKAUDIT_CHECKPOINT_DB") {
            Some(v) if is_off(&v) => None,
            Some(v) => Some(PathBuf::from(v)),
            None => defaults.checkpoint_db,
        };

        let max_iterations = parse_or(
            "TASKAUDIT_MAX_ITERATIONS",
            get("TASKAUDIT_MAX_ITERATIONS"),
            defaults.pipeline.max_iterations,
        )
        .clamp(1, MAX_REFLECTION_ITERATIONS);

        Self {
            ollama_url: get("TASKAUDIT_OLLAMA_URL").unwrap_or(defaults.ollama_url),
            model: get("TASKAUDIT_MODEL").unwrap_or(defaults.model),
            vision_model: get("TASKAUDIT_VISION_MODEL").unwrap_or(defaults.vision_model),
            timeout_secs: parse_or(
                "TASKAUDIT_TIMEOUT_SECS",
                get("TASKAUDIT_TIMEOUT_SECS"),
                defaults.timeout_secs,
            ),
            checkpoint_db,
            dump_dir: get("TASKAUDIT_DUMP_DIR").map(PathBuf::from),
            pipeline: PipelineOptions {
                relevance_gate: parse_flag(
                    "TASKAUDIT_RELEVANCE_GATE",
                    get("TASKAUDIT_RELEVANCE_GATE"),
                    defaults.pipeline.relevance_gate,
                ),
                reflection: parse_flag(
                    "TASKAUDIT_REFLECTION",
                    get("TASKAUDIT_REFLECTION"),
                    defaults.pipeline.reflection,
                ),
                max_iterations,
            },
        }
    }
}

fn is_off(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "off" | "none" | "false" | "0" | "disabled"
    )
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "Unparsable configuration value, using default");
            default
        }),
    }
}

fn parse_flag(key: &str, raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            tracing::warn!(key, value = other, "Unparsable boolean flag, using default");
            default
        }
    }
}
