use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HttpSettings {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub verify: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn default_user_agent() -> String {
    format!("gatecrash/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            verify: false,
            user_agent: default_user_agent(),
            timeout_ms: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_max_navigation_steps")]
    pub max_navigation_steps: usize,
}

pub fn default_threads() -> usize {
    1
}
pub fn default_max_navigation_steps() -> usize {
    32
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            max_navigation_steps: default_max_navigation_steps(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GatecrashConfig {
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Project file used when none is given on the command line.
    #[serde(default)]
    pub project: Option<PathBuf>,
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

impl GatecrashConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
