fn main() {
    if let Err(err) = codex_bridge::cli::run_codex_bridge() {
        tracing::error!(error = %err, "codex-bridge failed");
        std::process::exit(1);
    }
}
