use serde_json::{json, Map, Value};
use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};
use thiserror::Error;

const SETTINGS_DIR: &str = "callboard";
const SETTINGS_STORE_FILE: &str = "settings.json";

pub const ENV_PROJECT_URL: &str = "CALLBOARD_PROJECT_URL";
pub const ENV_ANON_KEY: &str = "CALLBOARD_ANON_KEY";

pub const KEY_PROJECT_URL: &str = "projectUrl";
pub const KEY_ANON_KEY: &str = "anonKey";
pub const KEY_EXPIRY_THRESHOLD_SECONDS: &str = "expiryThresholdSeconds";
pub const KEY_REFRESH_SETTLE_MS: &str = "refreshSettleMs";
pub const KEY_REMEMBER_SESSION: &str = "rememberSession";
pub const KEY_AUTO_REFRESH_ENABLED: &str = "autoRefreshEnabled";

fn defaults() -> HashMap<String, Value> {
  HashMap::from([
    (KEY_PROJECT_URL.to_string(), json!("")),
    (KEY_ANON_KEY.to_string(), json!("")),
    (KEY_EXPIRY_THRESHOLD_SECONDS.to_string(), json!(60)),
    (KEY_REFRESH_SETTLE_MS.to_string(), json!(100)),
    (KEY_REMEMBER_SESSION.to_string(), json!(false)),
    (KEY_AUTO_REFRESH_ENABLED.to_string(), json!(true)),
  ])
}

#[derive(Debug, Error)]
pub enum SettingsError {
  #[error("cannot locate a configuration directory")]
  NoConfigDir,
  #[error("settings io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("settings file is not valid json: {0}")]
  Json(#[from] serde_json::Error),
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
  let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
  Ok(dir.join(SETTINGS_DIR).join(SETTINGS_STORE_FILE))
}

#[derive(Clone)]
pub struct SettingsStore {
  path: Option<PathBuf>,
  values: Arc<Mutex<HashMap<String, Value>>>,
}

impl SettingsStore {
  /// Loads `path`, falling back to defaults when the file does not exist yet.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
    let path = path.as_ref().to_path_buf();
    let mut values = defaults();

    if path.exists() {
      let text = std::fs::read_to_string(&path)?;
      if !text.trim().is_empty() {
        let stored: Map<String, Value> = serde_json::from_str(&text)?;
        values.extend(stored);
      }
    }

    Ok(Self {
      path: Some(path),
      values: Arc::new(Mutex::new(values)),
    })
  }

  pub fn in_memory() -> Self {
    Self {
      path: None,
      values: Arc::new(Mutex::new(defaults())),
    }
  }

  fn get(&self, key: &str) -> Option<Value> {
    self
      .values
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .get(key)
      .cloned()
  }

  pub fn get_u64(&self, key: &str, fallback: u64) -> u64 {
    self.get(key).and_then(|v| v.as_u64()).unwrap_or(fallback)
  }

  pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
    self.get(key).and_then(|v| v.as_bool()).unwrap_or(fallback)
  }

  pub fn get_string(&self, key: &str) -> Option<String> {
    let v = self.get(key)?;
    let s = v.as_str()?.trim();
    if s.is_empty() {
      None
    } else {
      Some(s.to_string())
    }
  }

  pub fn set(&self, key: &str, value: impl Into<Value>) {
    self
      .values
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .insert(key.to_string(), value.into());
    self.save_logged();
  }

  pub fn remove(&self, key: &str) {
    self
      .values
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .remove(key);
    self.save_logged();
  }

  pub fn save(&self) -> Result<(), SettingsError> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    let snapshot: Map<String, Value> = self
      .values
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(snapshot))?)?;
    Ok(())
  }

  fn save_logged(&self) {
    if let Err(e) = self.save() {
      tracing::warn!(error = %e, "failed to save settings");
    }
  }

  /// Environment variables win over the file for the project coordinates.
  fn env_or_setting(&self, env: &str, key: &str) -> Option<String> {
    std::env::var(env)
      .ok()
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
      .or_else(|| self.get_string(key))
  }

  pub fn project_url(&self) -> Option<String> {
    self
      .env_or_setting(ENV_PROJECT_URL, KEY_PROJECT_URL)
      .map(|url| url.trim_end_matches('/').to_string())
  }

  pub fn anon_key(&self) -> Option<String> {
    self.env_or_setting(ENV_ANON_KEY, KEY_ANON_KEY)
  }
}
