use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{BackendConfig, SamplingParams};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::context::DEFAULT_CONTEXT_MESSAGES;
use crate::orchestrator::OrchestratorConfig;

pub const DEFAULT_ENDPOINT: &str = "https://api.replicate.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "murmur.db";
pub const ENV_PREFIX: &str = "MURMUR_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: String::new(),
            system_prompt: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub timeout_secs: u64,
    pub retry_max_elapsed_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_max_elapsed_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub update_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub max_messages: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_CONTEXT_MESSAGES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    pub title_max_chars: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            title_max_chars: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageSettings {
    /// Empty means the default file under the user's data directory.
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub dispatch: DispatchSettings,
    pub stream: StreamSettings,
    pub context: ContextSettings,
    pub conversation: ConversationSettings,
    pub storage: StorageSettings,
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        let provider = &mut self.provider;
        provider.endpoint = provider.endpoint.trim().trim_end_matches('/').to_string();
        if provider.endpoint.is_empty() {
            provider.endpoint = DEFAULT_ENDPOINT.to_string();
        }
        provider.api_key = provider.api_key.trim().to_string();
        provider.model = provider.model.trim().to_string();
        provider.system_prompt = provider
            .system_prompt
            .take()
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());

        if self.dispatch.timeout_secs == 0 {
            self.dispatch.timeout_secs = DispatchSettings::default().timeout_secs;
        }
        if self.conversation.title_max_chars == 0 {
            self.conversation.title_max_chars = ConversationSettings::default().title_max_chars;
        }
        self.storage.database = self.storage.database.trim().to_string();
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.provider.api_key.is_empty()
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.provider.endpoint, &self.provider.api_key)
            .with_model(&self.provider.model)
            .with_request_timeout(Duration::from_secs(self.dispatch.timeout_secs))
            .with_retry_max_elapsed(Duration::from_secs(self.dispatch.retry_max_elapsed_secs))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            context_max_messages: self.context.max_messages,
            update_interval: Duration::from_millis(self.stream.update_interval_ms),
            dispatch_timeout: Duration::from_secs(self.dispatch.timeout_secs),
            title_max_chars: self.conversation.title_max_chars,
            system_prompt: self.provider.system_prompt.clone(),
            sampling: SamplingParams {
                temperature: self.provider.temperature,
                top_p: self.provider.top_p,
                max_tokens: self.provider.max_tokens,
            },
        }
    }

    pub fn database_location(&self) -> String {
        if !self.storage.database.is_empty() {
            return self.storage.database.clone();
        }

        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
            .join(DATABASE_FILE_NAME)
            .to_string_lossy()
            .into_owned()
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(Self::figment(&config_path), &config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    /// Loads defaults, then the JSON file, then `MURMUR_*` environment overrides.
    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_from(figment: Figment, path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults and environment");
        }

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir()
            .join(format!("murmur-settings-{}-{nanos}", std::process::id()))
            .join(name)
    }

    fn file_only(path: &Path) -> Settings {
        let figment =
            Figment::from(Serialized::defaults(Settings::default())).merge(Json::file(path));
        SettingsStore::load_from(figment, path)
    }

    #[test]
    fn normalization_trims_and_restores_defaults() {
        let mut settings = Settings::default();
        settings.provider.endpoint = " https://api.example.com/v1/ ".to_string();
        settings.provider.api_key = "  key ".to_string();
        settings.provider.system_prompt = Some("   ".to_string());
        settings.dispatch.timeout_secs = 0;

        let settings = settings.normalized();
        assert_eq!(settings.provider.endpoint, "https://api.example.com/v1");
        assert_eq!(settings.provider.api_key, "key");
        assert_eq!(settings.provider.system_prompt, None);
        assert_eq!(settings.dispatch.timeout_secs, 30);
        assert!(settings.is_configured());
    }

    #[test]
    fn partial_files_merge_over_defaults() {
        let path = scratch_path(SETTINGS_FILE_NAME);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("scratch dir");
        std::fs::write(
            &path,
            r#"{"provider":{"api_key":"abc"},"context":{"max_messages":4}}"#,
        )
        .expect("write settings");

        let settings = file_only(&path);
        assert_eq!(settings.provider.api_key, "abc");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.context.max_messages, 4);
        assert_eq!(settings.stream.update_interval_ms, 50);

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let path = scratch_path(SETTINGS_FILE_NAME);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("scratch dir");
        std::fs::write(&path, "{ not json").expect("write settings");

        assert_eq!(file_only(&path), Settings::default());

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn update_persists_atomically_and_swaps_the_snapshot() {
        let path = scratch_path(SETTINGS_FILE_NAME);
        let store = SettingsStore {
            settings: Arc::new(ArcSwap::from_pointee(Settings::default())),
            config_path: path.clone(),
        };

        let mut next = Settings::default();
        next.provider.model = " small ".to_string();
        store.update(next).expect("update settings");

        assert_eq!(store.settings().provider.model, "small");
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(file_only(&path).provider.model, "small");

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn derived_configs_follow_settings() {
        let mut settings = Settings::default();
        settings.provider.temperature = Some(0.2);
        settings.stream.update_interval_ms = 0;

        let orchestrator = settings.orchestrator_config();
        assert_eq!(orchestrator.update_interval, Duration::ZERO);
        assert_eq!(orchestrator.sampling.temperature, Some(0.2));
        assert_eq!(
            settings.backend_config().request_timeout,
            Duration::from_secs(30)
        );
    }
}
