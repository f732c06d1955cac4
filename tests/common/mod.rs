#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use interruptible_rpc::lock::LockStatus;
use interruptible_rpc::{
    CallRegistry, Cx, LockClient, LockService, RpcClient, RpcConfig, RpcServer, TransportFactory,
    UnitFactory,
};
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::net::SocketAddr;
use std::sync::Arc;

pub use interruptible_rpc::test_utils::{
    DEFAULT_WAIT, MockConnection, init_test_logging, wait_until,
};
pub use interruptible_rpc::{
    assert_error_kind, assert_with_log, test_complete, test_phase, test_section,
};

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "INTERRUPTIBLE_RPC_PROPTEST_SEED";

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }
    None
}

/// A lock server and a client-side factory set sharing one process.
///
/// Client and server use separate registries, as they would in separate
/// processes.
pub struct LockStack {
    pub lock: LockService,
    pub server: RpcServer,
    pub server_registry: Arc<CallRegistry>,
    pub client_registry: Arc<CallRegistry>,
    pub units: UnitFactory,
    pub client: LockClient,
}

impl LockStack {
    pub fn start() -> Self {
        let lock = LockService::new();
        let server_registry = CallRegistry::shared();
        let server = RpcServer::bind(
            "127.0.0.1:0",
            Arc::clone(&server_registry),
            Arc::new(lock.clone()),
            &RpcConfig::default(),
        )
        .expect("bind lock server");
        server.start().expect("start lock server");

        let client_registry = CallRegistry::shared();
        let client = LockClient::new(RpcClient::new(
            TransportFactory::new(Arc::clone(&client_registry)),
            server.local_addr(),
        ));
        Self {
            units: UnitFactory::new(Arc::clone(&client_registry)),
            lock,
            server,
            server_registry,
            client_registry,
            client,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// A context for issuing calls from the test thread itself.
    pub fn caller(&self) -> Cx {
        Cx::new(Arc::clone(&self.client_registry))
    }

    /// Waits until the server has `n` handlers parked on the lock.
    pub fn wait_for_waiters(&self, n: usize) -> bool {
        wait_until(DEFAULT_WAIT, || self.lock.waiters() == n)
    }
}

impl Drop for LockStack {
    fn drop(&mut self) {
        self.server.shutdown();
        self.lock.shutdown();
    }
}
