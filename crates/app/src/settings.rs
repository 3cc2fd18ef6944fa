use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use maitri_chat::ChatOptions;
use maitri_llm::{
    AssistantGateway, DEFAULT_ENDPOINT, DEFAULT_OPENAI_MODEL, DEFAULT_PROVIDER_ID, ProviderConfig,
    UnavailableGateway, create_gateway,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "maitri";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "MAITRI_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub chat: ChatOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: None,
            max_tokens: None,
            chat: ChatOptions::default(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self
    }

    /// Fills an empty API key (and the model/endpoint that go with it) from the
    /// conventional `OPENAI_*` variables.
    pub fn with_environment_fallback(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if !self.api_key.trim().is_empty() {
            return self;
        }

        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let Some(api_key) = read("OPENAI_API_KEY") else {
            return self;
        };

        self.api_key = api_key;
        if let Some(model) = read("OPENAI_MODEL") {
            self.model = model;
        }
        if let Some(endpoint) = read("OPENAI_BASE_URL") {
            self.endpoint = endpoint;
        }
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if !self.is_valid() {
            return None;
        }

        Some(
            ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint, &self.model)
                .with_temperature(self.temperature)
                .with_max_tokens(self.max_tokens),
        )
    }

    /// Builds the assistant gateway, degrading to one that always fails so the chat
    /// still runs and shows the fallback reply.
    pub fn build_gateway(&self) -> Arc<dyn AssistantGateway> {
        let Some(config) = self.to_provider_config() else {
            tracing::warn!("no API key configured; assistant replies will use the fallback text");
            return Arc::new(UnavailableGateway::new("no API key configured"));
        };

        match create_gateway(config) {
            Ok(gateway) => {
                tracing::info!(
                    provider_id = %self.provider_id,
                    model = %self.model,
                    "initialized assistant gateway"
                );
                gateway
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to initialize assistant gateway");
                Arc::new(UnavailableGateway::new(error.to_string()))
            }
        }
    }
}

/// Reads an environment variable by name.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Settings split into two layers.
///
/// The stored layer is exactly what `settings.json` holds (over defaults) and is the only
/// thing ever written back. The effective layer adds `MAITRI_*` variables and the `OPENAI_*`
/// fallback on top and is what the app runs with.
pub struct SettingsStore {
    stored: ArcSwap<Settings>,
    effective: ArcSwap<Settings>,
    config_path: PathBuf,
    lookup: EnvLookup,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".maitri"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::open(config_path, Arc::new(|key: &str| std::env::var(key).ok()))
    }

    pub(crate) fn open(config_path: PathBuf, lookup: EnvLookup) -> Self {
        let stored = read_file_layer(&config_path);
        let effective = overlay_environment(&stored, &lookup);
        Self {
            stored: ArcSwap::from_pointee(stored),
            effective: ArcSwap::from_pointee(effective),
            config_path,
            lookup,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Settings in effect, environment included.
    pub fn settings(&self) -> Arc<Settings> {
        self.effective.load_full()
    }

    /// Settings as persisted in the file.
    pub fn stored_settings(&self) -> Arc<Settings> {
        self.stored.load_full()
    }

    /// Applies `change` to the stored layer, writes it out and recomputes the effective
    /// settings. Nothing changes in memory when the write fails.
    pub fn update(
        &self,
        change: impl FnOnce(&mut Settings),
    ) -> Result<Arc<Settings>, SettingsError> {
        let mut stored = Settings::clone(&self.stored.load());
        change(&mut stored);
        let stored = stored.normalized();

        write_settings_file(&self.config_path, &stored)?;
        tracing::info!(path = %self.config_path.display(), "saved settings");

        let effective = Arc::new(overlay_environment(&stored, &self.lookup));
        self.stored.store(Arc::new(stored));
        self.effective.store(Arc::clone(&effective));
        Ok(effective)
    }
}

fn read_file_layer(path: &Path) -> Settings {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no settings file, using defaults");
        return Settings::default();
    }

    Figment::from(Serialized::defaults(Settings::default()))
        .merge(Json::file(path))
        .extract::<Settings>()
        .map(Settings::normalized)
        .unwrap_or_else(|error| {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "unreadable settings file, using defaults"
            );
            Settings::default()
        })
}

fn overlay_environment(stored: &Settings, lookup: &EnvLookup) -> Settings {
    let overlaid = Figment::from(Serialized::defaults(stored))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<Settings>()
        .unwrap_or_else(|error| {
            tracing::warn!(error = %error, "ignoring malformed {ENV_PREFIX}* variables");
            stored.clone()
        });

    overlaid
        .normalized()
        .with_environment_fallback(|key| lookup(key))
}

fn write_settings_file(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let mut encoded = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
        stage: "encode-settings",
    })?;
    encoded.push(b'\n');

    if let Some(directory) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory).context(FileSystemSnafu {
            stage: "create-settings-directory",
            path: directory.to_path_buf(),
        })?;
    }

    // Readers never observe a half-written file.
    let staging = path.with_extension("json.partial");
    std::fs::write(&staging, &encoded).context(FileSystemSnafu {
        stage: "write-staging-file",
        path: staging.clone(),
    })?;
    std::fs::rename(&staging, path).context(FileSystemSnafu {
        stage: "replace-settings-file",
        path: path.to_path_buf(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("could not encode settings during `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("settings file step `{stage}` failed for {}: {source}", path.display()))]
    FileSystem {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
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

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}
