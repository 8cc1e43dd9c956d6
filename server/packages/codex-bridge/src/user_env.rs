use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;

use codex_bridge_error::BridgeError;

use crate::config::Settings;

/// Identity used when a request carries no user id. It keeps the
/// subprocess's built-in home.
pub const DEFAULT_USER: &str = "default";
const MAX_USER_ID_LEN: usize = 128;

/// Per-user launch inputs for the app-server subprocess.
pub trait UserEnvironment: Debug + Send + Sync {
    /// Isolated working home, or `None` to keep the subprocess default.
    fn user_home(&self, user_id: &str) -> Option<PathBuf>;

    /// Extra environment for the subprocess (credentials, home override).
    fn user_env(&self, user_id: &str) -> HashMap<String, String>;

    fn binary_path(&self) -> PathBuf;

    fn app_server_args(&self) -> Vec<String>;

    fn working_dir(&self) -> Option<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct SettingsEnvironment {
    binary: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    homes_dir: PathBuf,
    api_key: Option<String>,
}

impl SettingsEnvironment {
    pub fn new(settings: &Settings) -> Self {
        Self {
            binary: settings.binary_path(),
            args: settings.app_server_args.clone(),
            working_dir: settings
                .working_dir
                .clone()
                .or_else(|| std::env::current_dir().ok()),
            homes_dir: settings.homes_dir(),
            api_key: settings.openai_api_key.clone().filter(|key| !key.is_empty()),
        }
    }
}

impl UserEnvironment for SettingsEnvironment {
    fn user_home(&self, user_id: &str) -> Option<PathBuf> {
        if user_id == DEFAULT_USER {
            return None;
        }
        Some(self.homes_dir.join(user_id))
    }

    fn user_env(&self, user_id: &str) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(home) = self.user_home(user_id) {
            env.insert("CODEX_HOME".to_string(), home.to_string_lossy().into_owned());
        }
        if let Some(key) = &self.api_key {
            env.insert("OPENAI_API_KEY".to_string(), key.clone());
        }
        env
    }

    fn binary_path(&self) -> PathBuf {
        self.binary.clone()
    }

    fn app_server_args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.working_dir.clone()
    }
}

/// User ids name directories, so they are restricted to a safe alphabet.
pub fn validate_user_id(user_id: &str) -> Result<(), BridgeError> {
    let valid_chars = user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'));
    let valid = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && valid_chars
        && user_id != "."
        && user_id != "..";
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidRequest {
            message: format!("invalid user id: {user_id:?}"),
        })
    }
}
