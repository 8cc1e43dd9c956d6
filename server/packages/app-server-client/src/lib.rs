//! Client for the Codex `app-server`: newline-delimited JSON-RPC over the
//! stdio pipes of a subprocess.

mod client;
pub mod jsonrpc;
pub mod launch;
mod turn;

pub use client::{AppServerClient, ClientError, ClientOptions, CLIENT_NAME};
pub use jsonrpc::{IncomingMessage, RpcError};
pub use launch::{check_availability, find_in_path, LaunchSpec};
pub use turn::{RawEvent, TurnStream, CLOSED_MESSAGE, STALLED_MESSAGE};
