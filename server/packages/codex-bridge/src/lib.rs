//! Per-user Codex app-server sessions, republished as AG-UI events over
//! HTTP/SSE.

pub mod bridge;
pub mod broker;
pub mod cli;
pub mod config;
pub mod router;
pub mod user_env;
