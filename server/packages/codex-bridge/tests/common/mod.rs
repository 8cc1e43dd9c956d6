#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codex_bridge::broker::{BrokerConfig, SessionBroker};
use codex_bridge::user_env::{UserEnvironment, DEFAULT_USER};
use codex_bridge_app_server_client::ClientOptions;
use tempfile::TempDir;

/// Same scripted app-server the client tests drive; see the fixture for the
/// `FAKE_*` switches.
const FAKE_APP_SERVER: &str =
    include_str!("../../../app-server-client/tests/fixtures/fake_app_server.sh");

/// Launches the fake through `/bin/sh` with per-user homes under a temp dir.
#[derive(Debug)]
pub struct FakeEnvironment {
    script: PathBuf,
    binary: PathBuf,
    homes: PathBuf,
    work: PathBuf,
    env: HashMap<String, String>,
}

impl UserEnvironment for FakeEnvironment {
    fn user_home(&self, user_id: &str) -> Option<PathBuf> {
        (user_id != DEFAULT_USER).then(|| self.homes.join(user_id))
    }

    fn user_env(&self, user_id: &str) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if let Some(home) = self.user_home(user_id) {
            env.insert("CODEX_HOME".to_string(), home.to_string_lossy().into_owned());
        }
        env
    }

    fn binary_path(&self) -> PathBuf {
        self.binary.clone()
    }

    fn app_server_args(&self) -> Vec<String> {
        vec![
            self.script.to_string_lossy().into_owned(),
            "app-server".to_string(),
        ]
    }

    fn working_dir(&self) -> Option<PathBuf> {
        Some(self.work.clone())
    }
}

pub struct Harness {
    dir: TempDir,
    binary: PathBuf,
    env: HashMap<String, String>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("fake-app-server.sh"), FAKE_APP_SERVER)
            .expect("write fake app-server");
        let mut env = HashMap::new();
        env.insert(
            "SPAWN_LOG".to_string(),
            dir.path().join("spawns.log").to_string_lossy().into_owned(),
        );
        Self {
            dir,
            binary: PathBuf::from("/bin/sh"),
            env,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Overrides the launched program; a missing path makes spawns fail.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn homes(&self) -> PathBuf {
        self.dir.path().join("homes")
    }

    pub fn environment(&self) -> Arc<dyn UserEnvironment> {
        Arc::new(FakeEnvironment {
            script: self.dir.path().join("fake-app-server.sh"),
            binary: self.binary.clone(),
            homes: self.homes(),
            work: self.dir.path().to_path_buf(),
            env: self.env.clone(),
        })
    }

    pub fn broker(&self, config: BrokerConfig) -> SessionBroker {
        SessionBroker::new(config, self.environment())
    }

    pub fn spawn_count(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("spawns.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        max_sessions: Some(10),
        idle_timeout: None,
        cleanup_interval: Duration::from_secs(60),
        stderr_drain: Duration::from_millis(500),
        client: ClientOptions {
            api_key: None,
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(500),
            turn_idle_timeout: None,
        },
    }
}
