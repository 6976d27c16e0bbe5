use serde::{Deserialize, Serialize};
use std::path::Path;
use anyhow::{Context, Result};

use crate::token::{self, Credentials, DEFAULT_TOKEN_TTL_SECS};

pub const DEFAULT_SIGNATURE_SERVER_URL: &str = "http://localhost:4000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub display_name: String,
    pub livekit_url: String,
    pub signature_server_url: String,
    pub sdk_key: String,
    pub sdk_secret: String,
    pub token_ttl_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            livekit_url: String::new(),
            signature_server_url: DEFAULT_SIGNATURE_SERVER_URL.to_string(),
            sdk_key: String::new(),
            sdk_secret: String::new(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .context("Failed to parse settings JSON")?;
        Ok(settings)
    }

    /// Loads the file if there is one, then applies `SDK_KEY` / `SDK_SECRET`
    /// from the environment.
    pub fn load_or_default(path: &Path) -> Self {
        let settings = match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                if path.exists() {
                    tracing::warn!("ignoring unreadable settings: {err:#}");
                }
                Self::default()
            }
        };
        settings.with_env_overrides(|name| std::env::var(name).ok())
    }

    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = lookup("SDK_KEY").filter(|v| !v.trim().is_empty()) {
            self.sdk_key = key;
        }
        if let Some(secret) = lookup("SDK_SECRET").filter(|v| !v.trim().is_empty()) {
            self.sdk_secret = secret;
        }
        self
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings dir: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        Ok(())
    }

    /// Local signing credentials, if real ones are configured.
    pub fn credentials(&self) -> Option<Credentials> {
        token::credentials_configured(&self.sdk_key, &self.sdk_secret).then(|| Credentials {
            key: self.sdk_key.clone(),
            secret: self.sdk_secret.clone(),
        })
    }

    pub fn signature_server(&self) -> Option<String> {
        let url = self.signature_server_url.trim();
        (!url.is_empty()).then(|| url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_settings_have_reasonable_values() {
        let settings = Settings::default();
        assert_eq!(settings.livekit_url, "");
        assert_eq!(settings.signature_server_url, "http://localhost:4000");
        assert_eq!(settings.token_ttl_secs, 7200);
        assert!(settings.credentials().is_none());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("tempdir failed: {err}"),
        };
        let path = dir.path().join("nested").join("settings.json");

        let settings = Settings {
            display_name: "Ada".to_string(),
            livekit_url: "wss://example.livekit.cloud".to_string(),
            sdk_key: "key".to_string(),
            sdk_secret: "secret".to_string(),
            ..Settings::default()
        };

        assert!(settings.save(&path).is_ok());
        match Settings::load(&path) {
            Ok(loaded) => assert_eq!(loaded, settings),
            Err(err) => panic!("load failed: {err}"),
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("tempdir failed: {err}"),
        };
        let path = dir.path().join("settings.json");
        assert!(fs::write(&path, r#"{"displayName":"Grace"}"#).is_ok());

        let loaded = Settings::load(&path).unwrap_or_default();
        assert_eq!(loaded.display_name, "Grace");
        assert_eq!(loaded.signature_server_url, DEFAULT_SIGNATURE_SERVER_URL);
    }

    #[test]
    fn invalid_json_falls_back_to_defaults() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("tempdir failed: {err}"),
        };
        let path = dir.path().join("settings.json");
        assert!(fs::write(&path, "not json").is_ok());

        assert!(Settings::load(&path).is_err());
        let fallback = Settings::load_or_default(&path);
        assert_eq!(fallback.signature_server_url, DEFAULT_SIGNATURE_SERVER_URL);
    }

    #[test]
    fn environment_overrides_credentials() {
        let settings = Settings {
            sdk_key: "file-key".to_string(),
            sdk_secret: "file-secret".to_string(),
            ..Settings::default()
        }
        .with_env_overrides(|name| match name {
            "SDK_KEY" => Some("env-key".to_string()),
            "SDK_SECRET" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(settings.sdk_key, "env-key");
        assert_eq!(settings.sdk_secret, "file-secret");
    }

    #[test]
    fn placeholder_credentials_are_not_usable() {
        let settings = Settings {
            sdk_key: token::PLACEHOLDER_SDK_KEY.to_string(),
            sdk_secret: "real".to_string(),
            ..Settings::default()
        };
        assert!(settings.credentials().is_none());
        assert!(Settings { signature_server_url: " ".into(), ..Settings::default() }
            .signature_server()
            .is_none());
    }
}
