//! Configuration management with environment variable support.
//!
//! Every tunable has a `DEFAULT_*` constant and a `MOBILE_PILOT_*` environment
//! variable. [`get()`] reads the environment once and caches the result.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MOBILE_PILOT_VLM_ENDPOINT` | Chat completions URL | `http://127.0.0.1:8080/v1/chat/completions` |
//! | `MOBILE_PILOT_VLM_MODEL` | Model name | `qwen2.5-vl` |
//! | `MOBILE_PILOT_VLM_API_KEY` | Bearer token (else `OPENAI_API_KEY`) | none |
//! | `MOBILE_PILOT_VLM_MAX_TOKENS` | Maximum tokens per answer | `512` |
//! | `MOBILE_PILOT_VLM_TEMPERATURE` | Sampling temperature | `0.1` |
//! | `MOBILE_PILOT_VLM_CONNECT_TIMEOUT` | Connection timeout (seconds) | `10` |
//! | `MOBILE_PILOT_VLM_IMAGE_LIMIT_KB` | Screenshots above this are halved and sent as JPEG | `200` |
//! | `MOBILE_PILOT_FALLBACK_ENDPOINT` | Second provider URL | none |
//! | `MOBILE_PILOT_FALLBACK_MODEL` | Second provider model | primary model |
//! | `MOBILE_PILOT_ADB_PATH` | adb binary | `adb` |
//! | `MOBILE_PILOT_DEVICE_SERIAL` | Default device serial | first online device |
//! | `MOBILE_PILOT_ADB_TIMEOUT` | Per adb command timeout (seconds) | `15` |
//! | `MOBILE_PILOT_SETTLE_DELAY_MS` | Wait after an action before observing | `300` |
//! | `MOBILE_PILOT_MAX_PERCEIVE_RETRIES` | Capture retries before failing | `3` |
//! | `MOBILE_PILOT_MAX_PLAN_RETRIES` | Transient planning retries | `2` |
//! | `MOBILE_PILOT_MAX_CONSECUTIVE_FAILURES` | Recovery budget | `3` |
//! | `MOBILE_PILOT_MAX_TOTAL_ITERATIONS` | Hard iteration cap | `50` |
//! | `MOBILE_PILOT_ACTION_TIMEOUT` | Per action timeout (seconds) | `30` |
//! | `MOBILE_PILOT_PLAN_TIMEOUT` | Per planning call timeout (seconds) | `60` |
//! | `MOBILE_PILOT_VALIDATION_TIMEOUT` | Per validation timeout (seconds) | `30` |
//! | `MOBILE_PILOT_JOURNAL_DIR` | Base directory for run journals | `/tmp/mobile-pilot` |
//!
//! # Example
//!
//! ```bash
//! export MOBILE_PILOT_VLM_ENDPOINT="http://localhost:11434/v1/chat/completions"
//! export MOBILE_PILOT_VLM_MODEL="llava"
//! export MOBILE_PILOT_MAX_TOTAL_ITERATIONS=20
//! ```

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

pub const DEFAULT_VLM_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/completions";
pub const DEFAULT_VLM_MODEL: &str = "qwen2.5-vl";
pub const DEFAULT_VLM_MAX_TOKENS: u32 = 512;
pub const DEFAULT_VLM_TEMPERATURE: f32 = 0.1;
/// Seconds
pub const DEFAULT_VLM_CONNECT_TIMEOUT: u64 = 10;
pub const DEFAULT_VLM_IMAGE_LIMIT_KB: usize = 200;

pub const DEFAULT_ADB_PATH: &str = "adb";
/// Seconds
pub const DEFAULT_ADB_TIMEOUT: u64 = 15;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 300;

pub const DEFAULT_MAX_PERCEIVE_RETRIES: u32 = 3;
pub const DEFAULT_MAX_PLAN_RETRIES: u32 = 2;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const DEFAULT_MAX_TOTAL_ITERATIONS: u32 = 50;
/// Seconds
pub const DEFAULT_ACTION_TIMEOUT: u64 = 30;
/// Seconds
pub const DEFAULT_PLAN_TIMEOUT: u64 = 60;
/// Seconds
pub const DEFAULT_VALIDATION_TIMEOUT: u64 = 30;

pub const DEFAULT_JOURNAL_DIR: &str = "/tmp/mobile-pilot";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_VLM_ENDPOINT: &str = "MOBILE_PILOT_VLM_ENDPOINT";
pub const ENV_VLM_MODEL: &str = "MOBILE_PILOT_VLM_MODEL";
pub const ENV_VLM_API_KEY: &str = "MOBILE_PILOT_VLM_API_KEY";
pub const ENV_VLM_MAX_TOKENS: &str = "MOBILE_PILOT_VLM_MAX_TOKENS";
pub const ENV_VLM_TEMPERATURE: &str = "MOBILE_PILOT_VLM_TEMPERATURE";
pub const ENV_VLM_CONNECT_TIMEOUT: &str = "MOBILE_PILOT_VLM_CONNECT_TIMEOUT";
pub const ENV_VLM_IMAGE_LIMIT_KB: &str = "MOBILE_PILOT_VLM_IMAGE_LIMIT_KB";
pub const ENV_FALLBACK_ENDPOINT: &str = "MOBILE_PILOT_FALLBACK_ENDPOINT";
pub const ENV_FALLBACK_MODEL: &str = "MOBILE_PILOT_FALLBACK_MODEL";
pub const ENV_ADB_PATH: &str = "MOBILE_PILOT_ADB_PATH";
pub const ENV_DEVICE_SERIAL: &str = "MOBILE_PILOT_DEVICE_SERIAL";
pub const ENV_ADB_TIMEOUT: &str = "MOBILE_PILOT_ADB_TIMEOUT";
pub const ENV_SETTLE_DELAY_MS: &str = "MOBILE_PILOT_SETTLE_DELAY_MS";
pub const ENV_MAX_PERCEIVE_RETRIES: &str = "MOBILE_PILOT_MAX_PERCEIVE_RETRIES";
pub const ENV_MAX_PLAN_RETRIES: &str = "MOBILE_PILOT_MAX_PLAN_RETRIES";
pub const ENV_MAX_CONSECUTIVE_FAILURES: &str = "MOBILE_PILOT_MAX_CONSECUTIVE_FAILURES";
pub const ENV_MAX_TOTAL_ITERATIONS: &str = "MOBILE_PILOT_MAX_TOTAL_ITERATIONS";
pub const ENV_ACTION_TIMEOUT: &str = "MOBILE_PILOT_ACTION_TIMEOUT";
pub const ENV_PLAN_TIMEOUT: &str = "MOBILE_PILOT_PLAN_TIMEOUT";
pub const ENV_VALIDATION_TIMEOUT: &str = "MOBILE_PILOT_VALIDATION_TIMEOUT";
pub const ENV_JOURNAL_DIR: &str = "MOBILE_PILOT_JOURNAL_DIR";

/// Generic key honoured when no pilot-specific key is set
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderSettings,
    pub device: DeviceSettings,
    pub limits: LoopSettings,
    pub journal: JournalSettings,
}

/// Reasoning provider endpoint settings
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Screenshot size (KiB) above which uploads are compressed
    pub image_limit_kb: usize,
    pub fallback_endpoint: Option<String>,
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub adb_path: String,
    pub serial: Option<String>,
    /// Per adb command timeout (seconds)
    pub command_timeout: u64,
    pub settle_delay_ms: u64,
}

/// Control loop ceilings and timeouts
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_perceive_retries: u32,
    pub max_plan_retries: u32,
    pub max_consecutive_failures: u32,
    pub max_total_iterations: u32,
    pub action_timeout: Duration,
    pub plan_timeout: Duration,
    pub validation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JournalSettings {
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self::from_lookup(|_| None)
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        Self {
            provider: ProviderSettings::from_vars(&vars),
            device: DeviceSettings::from_vars(&vars),
            limits: LoopSettings::from_vars(&vars),
            journal: JournalSettings {
                base_dir: vars.string(ENV_JOURNAL_DIR, DEFAULT_JOURNAL_DIR),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn opt(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.opt(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        match self.opt(name) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(variable = name, value = %raw, "ignoring unparsable setting");
                default
            }),
            None => default,
        }
    }

    fn seconds(&self, name: &str, default: u64) -> Duration {
        Duration::from_secs(self.parsed(name, default))
    }
}

impl ProviderSettings {
    fn from_vars(vars: &Vars<'_>) -> Self {
        Self {
            endpoint: vars.string(ENV_VLM_ENDPOINT, DEFAULT_VLM_ENDPOINT),
            model: vars.string(ENV_VLM_MODEL, DEFAULT_VLM_MODEL),
            api_key: vars
                .opt(ENV_VLM_API_KEY)
                .or_else(|| vars.opt(ENV_OPENAI_API_KEY)),
            max_tokens: vars.parsed(ENV_VLM_MAX_TOKENS, DEFAULT_VLM_MAX_TOKENS),
            temperature: vars.parsed(ENV_VLM_TEMPERATURE, DEFAULT_VLM_TEMPERATURE),
            connect_timeout: vars.parsed(ENV_VLM_CONNECT_TIMEOUT, DEFAULT_VLM_CONNECT_TIMEOUT),
            image_limit_kb: vars.parsed(ENV_VLM_IMAGE_LIMIT_KB, DEFAULT_VLM_IMAGE_LIMIT_KB),
            fallback_endpoint: vars.opt(ENV_FALLBACK_ENDPOINT),
            fallback_model: vars.opt(ENV_FALLBACK_MODEL),
        }
    }
}

impl DeviceSettings {
    fn from_vars(vars: &Vars<'_>) -> Self {
        Self {
            adb_path: vars.string(ENV_ADB_PATH, DEFAULT_ADB_PATH),
            serial: vars.opt(ENV_DEVICE_SERIAL),
            command_timeout: vars.parsed(ENV_ADB_TIMEOUT, DEFAULT_ADB_TIMEOUT),
            settle_delay_ms: vars.parsed(ENV_SETTLE_DELAY_MS, DEFAULT_SETTLE_DELAY_MS),
        }
    }
}

impl LoopSettings {
    fn from_vars(vars: &Vars<'_>) -> Self {
        Self {
            max_perceive_retries: vars.parsed(ENV_MAX_PERCEIVE_RETRIES, DEFAULT_MAX_PERCEIVE_RETRIES),
            max_plan_retries: vars.parsed(ENV_MAX_PLAN_RETRIES, DEFAULT_MAX_PLAN_RETRIES),
            max_consecutive_failures: vars.parsed(
                ENV_MAX_CONSECUTIVE_FAILURES,
                DEFAULT_MAX_CONSECUTIVE_FAILURES,
            ),
            max_total_iterations: vars.parsed(ENV_MAX_TOTAL_ITERATIONS, DEFAULT_MAX_TOTAL_ITERATIONS),
            action_timeout: vars.seconds(ENV_ACTION_TIMEOUT, DEFAULT_ACTION_TIMEOUT),
            plan_timeout: vars.seconds(ENV_PLAN_TIMEOUT, DEFAULT_PLAN_TIMEOUT),
            validation_timeout: vars.seconds(ENV_VALIDATION_TIMEOUT, DEFAULT_VALIDATION_TIMEOUT),
        }
    }
}

/// Get the journal base directory (convenience function)
pub fn journal_base_dir() -> String {
    get().journal.base_dir.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.provider.endpoint, DEFAULT_VLM_ENDPOINT);
        assert_eq!(config.provider.api_key, None);
        assert_eq!(config.provider.image_limit_kb, 200);
        assert_eq!(config.device.adb_path, "adb");
        assert_eq!(config.limits.max_total_iterations, 50);
        assert_eq!(config.limits.action_timeout, Duration::from_secs(30));
        assert_eq!(config.journal.base_dir, DEFAULT_JOURNAL_DIR);
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            (ENV_VLM_MODEL, "llava"),
            (ENV_MAX_CONSECUTIVE_FAILURES, "5"),
            (ENV_PLAN_TIMEOUT, "90"),
            (ENV_DEVICE_SERIAL, "emulator-5554"),
            (ENV_VLM_IMAGE_LIMIT_KB, "512"),
        ]);
        assert_eq!(config.provider.model, "llava");
        assert_eq!(config.limits.max_consecutive_failures, 5);
        assert_eq!(config.limits.plan_timeout, Duration::from_secs(90));
        assert_eq!(config.device.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(config.provider.image_limit_kb, 512);
    }

    #[test]
    fn test_api_key_fallback() {
        let config = from_map(&[(ENV_OPENAI_API_KEY, "sk-generic")]);
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-generic"));

        let config = from_map(&[
            (ENV_OPENAI_API_KEY, "sk-generic"),
            (ENV_VLM_API_KEY, "sk-pilot"),
        ]);
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-pilot"));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = from_map(&[
            (ENV_MAX_TOTAL_ITERATIONS, "lots"),
            (ENV_VLM_ENDPOINT, "  "),
        ]);
        assert_eq!(config.limits.max_total_iterations, DEFAULT_MAX_TOTAL_ITERATIONS);
        assert_eq!(config.provider.endpoint, DEFAULT_VLM_ENDPOINT);
    }
}
