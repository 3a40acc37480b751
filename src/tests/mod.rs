//! Cross-component tests. Most scenarios run once per execution mode and
//! must observe the same results.


mod config_persistence;

use crate::bridge::{channel_pair, BridgeClient, BridgeServer, DEFAULT_CHANNEL_CAPACITY};
use crate::router::Router;
use crate::scope::ExecutionScope;
use crate::session::ProviderSessionManager;
use crate::storage::{LocalStorage, Storage};
use mocks::{MockFactory, MockRuntime, Script};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct,
    Bridged,
}

pub const MODES: [Mode; 2] = [Mode::Direct, Mode::Bridged];

/// A router and storage wired to mock providers, either in-process or
/// through an in-memory bridge to a background server.
pub struct Harness {
    pub router: Arc<Router>,
    pub storage: Storage,
    pub factory: Arc<MockFactory>,
    pub runtime: Arc<MockRuntime>,
    pub manager: Arc<ProviderSessionManager>,
}

impl Harness {
    /// Must be called inside a Tokio runtime.
    pub fn new(mode: Mode, script: Script) -> Self {
        let factory = Arc::new(MockFactory::with_script(script));
        let runtime = Arc::new(MockRuntime::default());
        let manager = Arc::new(ProviderSessionManager::new(factory.clone(), runtime.clone()));
        let local = Arc::new(LocalStorage::in_memory());

        let (router, storage) = match mode {
            Mode::Direct => (Router::direct(manager.clone()), Storage::local(local)),
            Mode::Bridged => {
                let server = Arc::new(BridgeServer::new(manager.clone(), local));
                let (near, far) = channel_pair(DEFAULT_CHANNEL_CAPACITY);
                tokio::spawn(server.serve(far));
                let client = BridgeClient::connect(near);
                (
                    Router::bridged(client.clone()),
                    Storage::bridged(client, ExecutionScope::DEFAULT),
                )
            }
        };

        Self {
            router: Arc::new(router),
            storage,
            factory,
            runtime,
            manager,
        }
    }
}
