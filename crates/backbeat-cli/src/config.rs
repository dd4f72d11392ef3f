use std::path::PathBuf;

use backbeat_services::EngineConfig;

#[derive(serde::Serialize, serde::Deserialize, Default)]
pub(crate) struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct PlayerConfig {
    /// How long to play before exiting
    #[serde(default = "default_play_seconds")]
    pub play_seconds: u64,
}

fn default_play_seconds() -> u64 {
    8
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self { play_seconds: default_play_seconds() }
    }
}

pub(crate) fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backbeat")
        .join("config.toml")
}

/// Missing or unreadable config falls back to defaults
pub(crate) fn load_config() -> AppConfig {
    let path = config_path();
    let Ok(text) = std::fs::read_to_string(&path) else {
        return AppConfig::default();
    };
    match toml::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Ignoring invalid config: {}", e);
            AppConfig::default()
        }
    }
}
