use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

pub const APP_SERVER_SUBCOMMAND: &str = "app-server";
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How to start one app-server subprocess.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn app_server(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![APP_SERVER_SUBCOMMAND.to_string()],
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn display_command(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(self.program.to_string_lossy().as_ref()));
        for arg in &self.args {
            parts.push(shell_quote(arg));
        }
        parts.join(" ")
    }
}

pub fn find_in_path(binary_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(binary_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Runs `<binary> --version`. Returns whether it succeeded and the trimmed
/// version output.
pub async fn check_availability(binary: &Path) -> (bool, Option<String>) {
    let mut command = Command::new(binary);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (true, (!version.is_empty()).then_some(version))
        }
        Ok(Ok(output)) => {
            tracing::warn!(
                binary = %binary.display(),
                code = output.status.code(),
                "availability check: version command failed"
            );
            (false, None)
        }
        Ok(Err(err)) => {
            tracing::error!(binary = %binary.display(), error = %err, "availability check failed");
            (false, None)
        }
        Err(_) => {
            tracing::error!(
                binary = %binary.display(),
                timeout_ms = VERSION_PROBE_TIMEOUT.as_millis() as u64,
                "availability check timed out"
            );
            (false, None)
        }
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
