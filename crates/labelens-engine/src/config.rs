use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Full configuration surface of the engine. Everything comes from the
/// environment; numeric knobs are clamped into sane ranges rather than
/// rejected.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_api_key: Option<String>,
    pub model_api_base: String,
    pub text_model: String,
    pub vision_model: String,
    pub search_api_key: Option<String>,
    pub search_api_base: String,
    pub barcode_api_base: String,
    /// Global deadline the whole pipeline races against.
    pub pipeline_timeout: Duration,
    /// Sub-budget for the research stage; batches stop 10s before it.
    pub research_timeout: Duration,
    /// Budget for one external search call.
    pub search_call_timeout: Duration,
    pub model_call_timeout: Duration,
    pub retries: usize,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    /// Minimum spacing between any two model-backend dispatches.
    pub min_call_interval: Duration,
    pub history_root: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            model_api_key: non_empty_env("LABELENS_MODEL_API_KEY")
                .or_else(|| non_empty_env("OPENAI_API_KEY")),
            model_api_base: non_empty_env("LABELENS_MODEL_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            text_model: non_empty_env("LABELENS_TEXT_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            vision_model: non_empty_env("LABELENS_VISION_MODEL")
                .unwrap_or_else(|| "gpt-4o".to_string()),
            search_api_key: non_empty_env("LABELENS_SEARCH_API_KEY")
                .or_else(|| non_empty_env("EXA_API_KEY")),
            search_api_base: non_empty_env("LABELENS_SEARCH_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.exa.ai".to_string()),
            barcode_api_base: non_empty_env("LABELENS_BARCODE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://world.openfoodfacts.org".to_string()),
            pipeline_timeout: env_duration_s("LABELENS_PIPELINE_TIMEOUT_S", 60.0, 25.0, 120.0),
            research_timeout: env_duration_s("LABELENS_RESEARCH_TIMEOUT_S", 30.0, 15.0, 35.0),
            search_call_timeout: env_duration_s("LABELENS_SEARCH_CALL_TIMEOUT_S", 15.0, 5.0, 30.0),
            model_call_timeout: env_duration_s("LABELENS_MODEL_CALL_TIMEOUT_S", 45.0, 10.0, 120.0),
            retries: env_f64("LABELENS_RETRIES", 3.0, 0.0, 5.0).round() as usize,
            retry_delay: env_duration_ms("LABELENS_RETRY_DELAY_MS", 1000.0, 100.0, 10_000.0),
            retry_backoff: env_f64("LABELENS_RETRY_BACKOFF", 2.0, 1.0, 4.0),
            min_call_interval: env_duration_ms("LABELENS_MIN_CALL_INTERVAL_MS", 2500.0, 0.0, 10_000.0),
            history_root: non_empty_env("LABELENS_HISTORY_DIR").map(PathBuf::from),
        }
    }

    /// A configuration with no credentials and fast knobs, for offline and
    /// test use.
    pub fn offline() -> Self {
        Self {
            model_api_key: None,
            model_api_base: "http://localhost:0".to_string(),
            text_model: "offline-text".to_string(),
            vision_model: "offline-vision".to_string(),
            search_api_key: None,
            search_api_base: "http://localhost:0".to_string(),
            barcode_api_base: "http://localhost:0".to_string(),
            pipeline_timeout: Duration::from_secs(60),
            research_timeout: Duration::from_secs(30),
            search_call_timeout: Duration::from_secs(15),
            model_call_timeout: Duration::from_secs(45),
            retries: 3,
            retry_delay: Duration::from_millis(1000),
            retry_backoff: 2.0,
            min_call_interval: Duration::ZERO,
            history_root: None,
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    non_empty_env(key)
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_duration_s(key: &str, default: f64, min: f64, max: f64) -> Duration {
    Duration::from_secs_f64(env_f64(key, default, min, max))
}

fn env_duration_ms(key: &str, default: f64, min: f64, max: f64) -> Duration {
    Duration::from_millis(env_f64(key, default, min, max).round() as u64)
}
