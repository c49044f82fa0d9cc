use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fs;
use std::str::FromStr;

/// Enforcement mode. Monitor logs threats without denying anything; Active
/// executes block and throttle verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Monitor,
    Active,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("monitor") {
            Ok(Mode::Monitor)
        } else if s.eq_ignore_ascii_case("active") {
            Ok(Mode::Active)
        } else {
            Err(format!("unknown mode '{}', expected MONITOR or ACTIVE", s))
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Mode::Monitor => serializer.serialize_str("MONITOR"),
            Mode::Active => serializer.serialize_str("ACTIVE"),
        }
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SentinAIConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: Mode,
    /// Paths skipped by analysis entirely. A pattern ending in `/**` matches
    /// any path with that prefix, otherwise the match is exact.
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AiConfig {
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            api_key: None,
            model: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreType {
    #[default]
    #[serde(rename = "in-memory")]
    InMemory,
    #[serde(rename = "distributed")]
    Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub store_type: StoreType,
    #[serde(default = "default_distributed_url")]
    pub distributed_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::InMemory,
            distributed_url: default_distributed_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config: HashMap::new(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_exclude_paths() -> Vec<String> {
    vec!["/health".to_string(), "/actuator/**".to_string()]
}

fn default_ai_provider() -> String {
    "openai".to_string()
}

fn default_distributed_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Default for SentinAIConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: Mode::Monitor,
            exclude_paths: default_exclude_paths(),
            ai: AiConfig::default(),
            store: StoreConfig::default(),
            modules: HashMap::new(),
        }
    }
}

impl SentinAIConfig {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let config: SentinAIConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn is_active_mode(&self) -> bool {
        self.mode == Mode::Active
    }

    pub fn is_monitor_mode(&self) -> bool {
        self.mode == Mode::Monitor
    }

    /// Modules are enabled by default unless explicitly turned off.
    pub fn is_module_enabled(&self, module_id: &str) -> bool {
        self.modules.get(module_id).map_or(true, |m| m.enabled)
    }

    /// Whether the module has a configuration section at all. Opt-in modules
    /// key their enablement off this.
    pub fn has_module_config(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    fn module_option(&self, module_id: &str, key: &str) -> Option<&serde_yaml::Value> {
        self.modules.get(module_id)?.config.get(key)
    }

    /// Integer module option; tolerates quoted numbers in the YAML.
    pub fn module_option_u64(&self, module_id: &str, key: &str, default: u64) -> u64 {
        self.module_option(module_id, key)
            .and_then(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .unwrap_or(default)
    }

    /// Float module option; tolerates integers and quoted numbers.
    pub fn module_option_f64(&self, module_id: &str, key: &str, default: f64) -> f64 {
        self.module_option(module_id, key)
            .and_then(|value| {
                value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .unwrap_or(default)
    }

    pub fn module_option_str(&self, module_id: &str, key: &str) -> Option<String> {
        self.module_option(module_id, key)
            .and_then(|value| value.as_str())
            .map(|s| s.trim().to_string())
    }
}
