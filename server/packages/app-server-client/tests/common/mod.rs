#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use codex_bridge_app_server_client::{AppServerClient, ClientOptions, LaunchSpec};
use tempfile::TempDir;

/// Scripted stand-in for `codex app-server`. Behaviour is switched through
/// environment variables so one script covers every scenario:
///
/// - `FAKE_TURN`: `complete` (default), `crash`, `reject`, `failed`,
///   `stall` (never completes), `slow` (one second between deltas) or
///   `anonymous` (no turn id in the `turn/start` response)
/// - `FAKE_LOGIN`: `reject` makes `account/login/start` fail
/// - `SPAWN_LOG`: file that receives one line per spawn
const FAKE_APP_SERVER: &str = include_str!("../fixtures/fake_app_server.sh");

pub struct FakeAppServer {
    dir: TempDir,
    script: PathBuf,
    env: HashMap<String, String>,
}

impl FakeAppServer {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let script = dir.path().join("fake-app-server.sh");
        std::fs::write(&script, FAKE_APP_SERVER).expect("write fake app-server");
        let mut env = HashMap::new();
        env.insert(
            "SPAWN_LOG".to_string(),
            dir.path().join("spawns.log").to_string_lossy().into_owned(),
        );
        Self { dir, script, env }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Run through `/bin/sh` so the freshly written file never needs the
    /// executable bit.
    pub fn launch(&self) -> LaunchSpec {
        LaunchSpec::app_server("/bin/sh")
            .with_args([self.script.to_string_lossy().into_owned(), "app-server".to_string()])
            .with_env(self.env.clone())
            .with_cwd(self.dir.path())
    }

    pub fn client(&self) -> AppServerClient {
        self.client_with(ClientOptions {
            api_key: None,
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(500),
            turn_idle_timeout: None,
        })
    }

    pub fn client_with(&self, options: ClientOptions) -> AppServerClient {
        AppServerClient::new(self.launch(), options)
    }

    pub fn spawn_count(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("spawns.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}
