use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use robochat_llm::{DEFAULT_OPENAI_MODEL, ModelRef, ProviderConfig};
use robochat_storage::RobotId;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::robot::{DEFAULT_CONTEXT_COUNT, Robot};
use crate::service::ServiceOptions;
use crate::throttle::DEFAULT_THROTTLE_INTERVAL;

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_ROBOT_NAME: &str = "assistant";
pub const SETTINGS_DIRECTORY_NAME: &str = "robochat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "robochat.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            models: default_models(),
        }
    }
}

impl ProviderSettings {
    /// Provider config for the configured endpoint; `None` until an api key is set.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if !self.is_valid() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.default_model_name()),
        ))
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn default_model_name(&self) -> String {
        self.models
            .iter()
            .map(|model| model.trim())
            .find(|model| !model.is_empty())
            .unwrap_or(DEFAULT_OPENAI_MODEL)
            .to_string()
    }

    pub fn default_model(&self) -> ModelRef {
        ModelRef::new(self.provider_id.clone(), self.default_model_name())
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.models = self
            .models
            .into_iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect();
        if self.models.is_empty() {
            self.models = default_models();
        }
        self
    }
}

/// One configured persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotSettings {
    /// Assigned on first normalization so topics stay attached across runs.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_robot_name")]
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    /// `provider/model`, or a bare model id on the configured provider.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_context_count")]
    pub context_count: usize,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: default_robot_name(),
            prompt: String::new(),
            model: None,
            context_count: default_context_count(),
        }
    }
}

impl RobotSettings {
    fn normalized(mut self) -> Self {
        self.id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| RobotId::parse(id).is_ok())
            .or_else(|| Some(RobotId::new_v7().to_string()));
        self.name = non_blank_or(self.name, default_robot_name);
        self.prompt = self.prompt.trim().to_string();
        self.model = self
            .model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self
    }

    /// Builds the runtime robot; the model falls back to the provider's first model.
    pub fn to_robot(&self, provider: &ProviderSettings) -> Robot {
        let model = match self.model.as_deref() {
            Some(raw) => parse_model_ref(raw, &provider.provider_id),
            None => provider.default_model(),
        };
        let mut robot = Robot::new(self.name.clone(), model)
            .with_prompt(self.prompt.clone())
            .with_context_count(self.context_count);
        if let Some(id) = self.id.as_deref().and_then(|id| RobotId::parse(id).ok()) {
            robot.id = id;
        }
        robot
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub provider: ProviderSettings,
    /// Defaults to `robochat.db` next to the settings file.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,
    #[serde(default = "default_robots")]
    pub robots: Vec<RobotSettings>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            database_path: None,
            throttle_interval_ms: default_throttle_interval_ms(),
            robots: default_robots(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.provider = self.provider.normalized();
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        if self.throttle_interval_ms == 0 {
            self.throttle_interval_ms = default_throttle_interval_ms();
        }
        self.robots = self
            .robots
            .into_iter()
            .map(RobotSettings::normalized)
            .collect();
        if self.robots.is_empty() {
            self.robots = default_robots()
                .into_iter()
                .map(RobotSettings::normalized)
                .collect();
        }
        self
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            throttle_interval: Duration::from_millis(self.throttle_interval_ms),
        }
    }

    pub fn robots(&self) -> Vec<Robot> {
        self.robots
            .iter()
            .map(|robot| robot.to_robot(&self.provider))
            .collect()
    }

    /// Robot named `name` (case-insensitive), or the first configured one.
    pub fn robot(&self, name: Option<&str>) -> Option<Robot> {
        let settings = match name {
            Some(name) => self
                .robots
                .iter()
                .find(|robot| robot.name.eq_ignore_ascii_case(name.trim()))?,
            None => self.robots.first()?,
        };
        Some(settings.to_robot(&self.provider))
    }

    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join(DATABASE_FILE_NAME))
    }
}

/// Settings file on disk plus the snapshot readers share.
pub struct SettingsStore {
    path: PathBuf,
    current: ArcSwap<AppSettings>,
}

impl SettingsStore {
    /// `<config dir>/robochat`, or `.robochat` when the platform has no config dir.
    pub fn default_config_dir() -> PathBuf {
        match dirs::config_dir() {
            Some(base) => base.join(SETTINGS_DIRECTORY_NAME),
            None => PathBuf::from(".robochat"),
        }
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(path: PathBuf) -> Self {
        let current = ArcSwap::from_pointee(read_settings(&path));
        Self { path, current }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    pub fn config_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => Self::default_config_dir(),
        }
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.current.load_full()
    }

    /// Normalizes, writes to disk, then publishes the new snapshot.
    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let settings = Arc::new(settings.normalized());
        self.write(&settings)?;
        self.current.store(settings);
        Ok(())
    }

    /// Writes the snapshot back unless the file already holds exactly it.
    /// Generated robot ids only survive restarts once this has run.
    pub fn save_if_changed(&self) -> Result<bool, SettingsError> {
        let current = self.settings();
        let stored = std::fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<AppSettings>(&raw).ok());
        if stored.as_ref() == Some(&*current) {
            return Ok(false);
        }
        self.write(&current)?;
        Ok(true)
    }

    fn write(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        let dir = self.config_dir();
        std::fs::create_dir_all(&dir).context(CreateDirSnafu {
            stage: "settings-create-dir",
            path: dir.clone(),
        })?;
        let json = serde_json::to_vec_pretty(settings).context(SerializeConfigSnafu {
            stage: "settings-serialize",
        })?;

        let staged = self.path.with_extension("json.partial");
        std::fs::write(&staged, json).context(WriteFileSnafu {
            stage: "settings-stage",
            path: staged.clone(),
        })?;
        std::fs::rename(&staged, &self.path).context(ReplaceFileSnafu {
            stage: "settings-replace",
            path: self.path.clone(),
        })?;

        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

/// Defaults merged with whatever the file provides. An unreadable file is
/// logged and ignored.
fn read_settings(path: &Path) -> AppSettings {
    let layered = Figment::from(Serialized::defaults(AppSettings::default()));
    let layered = if path.is_file() {
        layered.merge(Json::file(path))
    } else {
        tracing::info!(path = %path.display(), "no settings file yet, using defaults");
        layered
    };

    layered
        .extract::<AppSettings>()
        .unwrap_or_else(|error| {
            tracing::warn!(path = %path.display(), %error, "ignoring unreadable settings file");
            AppSettings::default()
        })
        .normalized()
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create settings directory {} at `{stage}`: {source}", path.display()))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("settings do not serialize at `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {} at `{stage}`: {source}", path.display()))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot replace {} at `{stage}`: {source}", path.display()))]
    ReplaceFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// `provider/model` splits at the first slash; a bare id stays on `default_provider`.
pub fn parse_model_ref(raw: &str, default_provider: &str) -> ModelRef {
    match raw.split_once('/') {
        Some((provider, model)) if !provider.trim().is_empty() && !model.trim().is_empty() => {
            ModelRef::new(provider.trim(), model.trim())
        }
        _ => ModelRef::new(default_provider, raw.trim()),
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_models() -> Vec<String> {
    vec![DEFAULT_OPENAI_MODEL.to_string()]
}

fn default_robot_name() -> String {
    DEFAULT_ROBOT_NAME.to_string()
}

fn default_context_count() -> usize {
    DEFAULT_CONTEXT_COUNT
}

fn default_throttle_interval_ms() -> u64 {
    DEFAULT_THROTTLE_INTERVAL.as_millis() as u64
}

fn default_robots() -> Vec<RobotSettings> {
    vec![RobotSettings::default()]
}
