//! Gateway configuration.
//!
//! Everything lives in one shared `Setting.json` with camelCase keys, edited
//! by the desktop frontend. String values support `${VAR}` environment
//! substitution so API keys and paths never have to be written into the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_GATEWAY_PORT: u16 = 55601;
const DEFAULT_MEMORY_DB_PORT: u16 = 55603;
const DEFAULT_MEMORY_WEB_PORT: u16 = 55606;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub gateway_port: u16,
    pub memory_db_port: u16,
    pub memory_web_port: u16,
    /// Base URL of the memory-engine process; derived from the web port when
    /// absent.
    pub memory_api_url: Option<String>,
    /// Unpacked graph-database runtime; platform data dir when absent.
    pub memory_runtime_dir: Option<PathBuf>,
    pub current_character_index: usize,
    pub character_list: Vec<CharacterSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterSettings {
    pub name: String,
    pub is_enable_memory: bool,
    pub model_name: String,
    /// Opaque memory-cube identifier for this character.
    pub cube_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_port: DEFAULT_GATEWAY_PORT,
            memory_db_port: DEFAULT_MEMORY_DB_PORT,
            memory_web_port: DEFAULT_MEMORY_WEB_PORT,
            memory_api_url: None,
            memory_runtime_dir: None,
            current_character_index: 0,
            character_list: Vec::new(),
        }
    }
}

impl Default for CharacterSettings {
    fn default() -> Self {
        Self {
            name: "companion".to_string(),
            is_enable_memory: false,
            model_name: String::new(),
            cube_id: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut value: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        substitute_env(&mut value);
        serde_json::from_value(value).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn current_character(&self) -> Option<&CharacterSettings> {
        self.character_list.get(self.current_character_index)
    }

    pub fn memory_enabled(&self) -> bool {
        self.current_character()
            .map(|c| c.is_enable_memory)
            .unwrap_or(false)
    }

    pub fn memory_api_url(&self) -> String {
        self.memory_api_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.memory_web_port))
    }

    pub fn memory_runtime_dir(&self) -> PathBuf {
        self.memory_runtime_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("companion-gateway")
                .join("neo4j")
        })
    }
}

/// Replaces `${VAR}` occurrences in every string value, recursively.
/// Unknown variables are left as-is so a typo is visible instead of silently
/// becoming empty.
fn substitute_env(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("${") {
                *s = substitute_str(s);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_env(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env(item);
            }
        }
        _ => {}
    }
}

fn substitute_str(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => output.push_str(&value),
                    Err(_) => {
                        output.push_str("${");
                        output.push_str(name);
                        output.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                return output;
            }
        }
    }
    output.push_str(rest);
    output
}
