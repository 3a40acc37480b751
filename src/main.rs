//! Background context as a process: serves the bridge on stdin/stdout.
//!
//! Stdout carries protocol frames only; logs go to stderr.

use assistant_core::bridge::{stdio_channel, BridgeServer, DEFAULT_CHANNEL_CAPACITY};
use assistant_core::providers::UnsupportedRuntime;
use assistant_core::storage::{KvStore, LocalStorage};
use assistant_core::{AssistantError, ProviderSessionManager};
use std::path::PathBuf;
use std::sync::Arc;

const DATA_DIR_ENV: &str = "ASSISTANT_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "assistant-data";

#[tokio::main]
async fn main() -> Result<(), AssistantError> {
    assistant_core::init_logging();

    let data_dir = std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    log::info!("Host: storing data in {}", data_dir.display());

    let storage = Arc::new(LocalStorage::new(KvStore::open(data_dir.clone())?));
    let manager = Arc::new(ProviderSessionManager::with_defaults(Arc::new(UnsupportedRuntime)));
    let server = Arc::new(BridgeServer::new(manager, storage));

    let channel = stdio_channel(tokio::io::stdin(), tokio::io::stdout(), DEFAULT_CHANNEL_CAPACITY);
    server.serve(channel).await
}
