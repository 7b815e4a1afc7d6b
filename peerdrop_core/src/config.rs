use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::coordinator::CompletionPolicy;
use crate::driver::SessionOptions;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "peerdrop";
const APP_NAME: &str = "peerdrop";
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:5001/ws";
pub const DEFAULT_SHARE_BASE_URL: &str = "http://localhost:3000/receive";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub relay_url: String,
    /// Prefix of the link handed to receivers; the session id is appended
    pub share_base_url: String,
    pub ice_servers: Vec<String>,
    pub download_path: PathBuf,
    pub download_limit: u32,
    pub completion: CompletionPolicy,
    /// Write received files to `download_path` as soon as they complete
    pub auto_save: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let download_path = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerdrop");

        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            share_base_url: DEFAULT_SHARE_BASE_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            download_path,
            download_limit: 1,
            completion: CompletionPolicy::ResetPeer,
            auto_save: true,
        }
    }
}

impl AppConfig {
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(test_path) = std::env::var("PEERDROP_TEST_CONFIG_DIR") {
            return Some(PathBuf::from(test_path).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Config file if present, defaults otherwise, then environment overrides
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = match Self::get_config_path().map(fs::read_to_string) {
            Some(Ok(content)) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed config file: {}", e);
                Self::default()
            }),
            _ => Self::default(),
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PEERDROP_RELAY_URL") {
            if !url.trim().is_empty() {
                self.relay_url = url.trim().to_string();
            }
        }
    }

    pub fn save(&self) {
        let Some(path) = Self::get_config_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!("Could not save config to {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Could not serialize config: {}", e),
        }
    }

    pub fn share_link(&self, session_id: &str) -> String {
        format!("{}/{}", self.share_base_url.trim_end_matches('/'), session_id)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            completion: self.completion,
            save_dir: self.auto_save.then(|| self.download_path.clone()),
        }
    }
}
