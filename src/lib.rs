//! Dual-mode orchestration core for an AI assistant.
//!
//! Features (chat, translation, summarization, rewriting, language detection,
//! speech-to-text, text-to-speech) are called through a [`Router`] that runs
//! them either in-process ([`ExecutionMode::Direct`]) or across a message
//! bridge to a background context ([`ExecutionMode::Bridged`]), with the same
//! results, streaming order and error kinds in both modes.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod providers;
pub mod router;
pub mod scope;
pub mod session;
pub mod storage;

#[cfg(test)]
mod tests;

pub use config::{AppConfig, ConfigController, FeatureConfig, FeatureKind, ProviderKind};
pub use error::{AssistantError, FeatureStatus};
pub use router::{ExecutionMode, Router, SynthesisOutput, TextStream};
pub use scope::ExecutionScope;
pub use session::ProviderSessionManager;
pub use storage::Storage;

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Guards are never held across an `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize the logger (stderr, default filter `info`, overridable with
/// `RUST_LOG`).
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}
