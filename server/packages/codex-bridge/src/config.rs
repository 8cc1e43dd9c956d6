use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use codex_bridge_app_server_client::launch::APP_SERVER_SUBCOMMAND;
use codex_bridge_app_server_client::{find_in_path, ClientOptions};

use crate::broker::BrokerConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
const CODEX_BINARY: &str = "codex";

/// Process-wide settings, parsed once by the binary and passed down.
#[derive(Parser, Debug, Clone)]
#[command(name = "codex-bridge", bin_name = "codex-bridge")]
#[command(about = "Per-user Codex app-server sessions over HTTP/SSE", version)]
pub struct Settings {
    #[arg(long, short = 'H', env = "CODEX_BRIDGE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, short = 'p', env = "CODEX_BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Bearer token required on API routes.
    #[arg(long, short = 't', env = "CODEX_BRIDGE_TOKEN")]
    pub token: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Defaults to `codex` found on PATH.
    #[arg(long, env = "CODEX_BINARY_PATH")]
    pub codex_binary_path: Option<PathBuf>,

    #[arg(
        long = "app-server-arg",
        allow_hyphen_values = true,
        default_values_t = [APP_SERVER_SUBCOMMAND.to_string()]
    )]
    pub app_server_args: Vec<String>,

    /// Subprocess working directory. Defaults to the current directory.
    #[arg(long, env = "CODEX_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Parent of the per-user CODEX_HOME directories.
    #[arg(long, env = "CODEX_HOMES_DIR")]
    pub homes_dir: Option<PathBuf>,

    /// Session ceiling; 0 means unlimited.
    #[arg(long, env = "CODEX_BRIDGE_MAX_SESSIONS", default_value_t = 50)]
    pub max_sessions: usize,

    /// Idle eviction threshold; 0 disables eviction.
    #[arg(long, env = "CODEX_BRIDGE_IDLE_TIMEOUT_SECS", default_value_t = 1800)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "CODEX_BRIDGE_CLEANUP_INTERVAL_SECS", default_value_t = 60)]
    pub cleanup_interval_secs: u64,

    #[arg(long, env = "CODEX_BRIDGE_SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    #[arg(long, env = "CODEX_BRIDGE_STDERR_DRAIN_MS", default_value_t = 1_000)]
    pub stderr_drain_ms: u64,

    #[arg(long, env = "CODEX_BRIDGE_REQUEST_TIMEOUT_MS", default_value_t = 120_000)]
    pub request_timeout_ms: u64,

    /// Longest silence inside a running turn; 0 waits forever.
    #[arg(long, env = "CODEX_BRIDGE_TURN_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub turn_idle_timeout_secs: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    pub cors_allow_origin: Vec<String>,
}

impl Settings {
    pub fn binary_path(&self) -> PathBuf {
        self.codex_binary_path
            .clone()
            .or_else(|| find_in_path(CODEX_BINARY))
            .unwrap_or_else(|| PathBuf::from(CODEX_BINARY))
    }

    pub fn homes_dir(&self) -> PathBuf {
        self.homes_dir.clone().unwrap_or_else(default_homes_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            api_key: self.openai_api_key.clone().filter(|key| !key.is_empty()),
            request_timeout: Duration::from_millis(self.request_timeout_ms.max(1)),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            turn_idle_timeout: (self.turn_idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.turn_idle_timeout_secs)),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_sessions: (self.max_sessions > 0).then_some(self.max_sessions),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
            stderr_drain: Duration::from_millis(self.stderr_drain_ms),
            client: self.client_options(),
        }
    }
}

fn default_homes_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("codex-bridge").join("homes"))
        .unwrap_or_else(|| PathBuf::from(".").join(".codex-bridge").join("homes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["codex-bridge"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).expect("parse settings")
    }

    #[test]
    fn zero_disables_ceiling_and_eviction() {
        let settings = parse(&[
            "--max-sessions",
            "0",
            "--idle-timeout-secs",
            "0",
            "--turn-idle-timeout-secs",
            "0",
        ]);
        let config = settings.broker_config();
        assert_eq!(config.max_sessions, None);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.client.turn_idle_timeout, None);
        assert_eq!(
            parse(&[]).client_options().turn_idle_timeout,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn durations_come_from_flags() {
        let settings = parse(&[
            "--max-sessions",
            "3",
            "--idle-timeout-secs",
            "90",
            "--cleanup-interval-secs",
            "5",
            "--shutdown-grace-ms",
            "250",
            "--request-timeout-ms",
            "1500",
        ]);
        let config = settings.broker_config();
        assert_eq!(config.max_sessions, Some(3));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.client.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.client.request_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn app_server_args_accept_flags() {
        let settings = parse(&[
            "--app-server-arg",
            "app-server",
            "--app-server-arg",
            "--listen=stdio",
        ]);
        assert_eq!(settings.app_server_args, vec!["app-server", "--listen=stdio"]);
    }

    #[test]
    fn explicit_binary_and_homes_win() {
        let settings = parse(&["--codex-binary-path", "/opt/codex", "--homes-dir", "/srv/homes"]);
        assert_eq!(settings.binary_path(), PathBuf::from("/opt/codex"));
        assert_eq!(settings.homes_dir(), PathBuf::from("/srv/homes"));
    }
}
