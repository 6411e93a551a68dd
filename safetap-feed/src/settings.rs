use crate::store::MessageStore;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration
///
/// Read from an optional `safetap` config file in the working directory and
/// from `SAFETAP__*` environment variables, in that order of precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Scopes the shared chat collection
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Number of most recent messages requested per snapshot
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Directory of the local message store
    #[serde(default = "default_storage_directory")]
    pub storage: PathBuf,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    /// `host:port` of the relay; chat runs local-only without it
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Signed-in participant id; anonymous when absent
    #[serde(default)]
    pub auth_uid: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            page_size: default_page_size(),
            storage: default_storage_directory(),
            storage_key: default_storage_key(),
            remote_addr: None,
            auth_uid: None,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(File::with_name("safetap").required(false))
    }

    /// Loads settings from a specific config file plus the environment
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load_from(File::from(path))
    }

    fn load_from<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("SAFETAP").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Path of the shared chat collection
    pub fn collection_path(&self) -> String {
        format!("/artifacts/{}/public/data/chatMessages", self.app_id)
    }
}

fn default_app_id() -> String {
    String::from("default-app-id")
}

fn default_page_size() -> usize {
    50
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("./var")
}

fn default_storage_key() -> String {
    String::from(MessageStore::DEFAULT_KEY)
}

#[cfg(test)]
mod test {
    use super::Settings;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.page_size, 50);
        assert_eq!(settings.storage_key, "@SafeTapChatMessages");
        assert_eq!(
            settings.collection_path(),
            "/artifacts/default-app-id/public/data/chatMessages"
        );
        assert!(settings.remote_addr.is_none());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "app_id = \"safetap\"").unwrap();
        writeln!(file, "page_size = 20").unwrap();
        writeln!(file, "remote_addr = \"localhost:3000\"").unwrap();
        file.flush().unwrap();

        let settings = Settings::load_file(file.path()).unwrap();
        assert_eq!(settings.app_id, "safetap");
        assert_eq!(settings.page_size, 20);
        assert_eq!(settings.remote_addr.as_deref(), Some("localhost:3000"));
        assert_eq!(settings.storage_key, "@SafeTapChatMessages");
    }
}
