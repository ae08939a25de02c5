use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_BOLT_PORT: u16 = 7687;
const DEFAULT_HTTP_PORT: u16 = 7474;

/// Sidecar-relevant slice of the shared `Setting.json`.
///
/// Loaded fresh before every start attempt so an operator can change ports
/// between restarts without touching the running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarSettings {
    pub embedded_enabled: bool,
    pub bolt_port: u16,
    pub http_port: u16,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingFile {
    #[serde(default = "default_bolt_port")]
    memory_db_port: u16,
    #[serde(default = "default_http_port")]
    memory_web_port: u16,
    #[serde(default)]
    current_character_index: usize,
    #[serde(default)]
    character_list: Vec<CharacterEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CharacterEntry {
    #[serde(default)]
    is_enable_memory: bool,
}

fn default_bolt_port() -> u16 {
    DEFAULT_BOLT_PORT
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl SidecarSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: SettingFile =
            serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        // Memory is a per-character toggle; the selected character decides
        // whether an embedded sidecar is wanted at all.
        let embedded_enabled = file
            .character_list
            .get(file.current_character_index)
            .map(|character| character.is_enable_memory)
            .unwrap_or(false);

        Ok(Self {
            embedded_enabled,
            bolt_port: file.memory_db_port,
            http_port: file.memory_web_port,
        })
    }
}
