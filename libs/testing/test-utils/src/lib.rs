//! Shared test utilities for RPC client testing
//!
//! This crate provides reusable test infrastructure:
//! - `TestEchoServer`: local `echo.v1.EchoService` endpoint that records requests
//! - `TestDataBuilder`: Deterministic test data generation
//! - `assertions`: Custom assertion helpers for call outcomes
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestEchoServer};
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn my_client_test() {
//!     let server = TestEchoServer::start().await;
//!     let builder = TestDataBuilder::from_test_name("my_client_test");
//!
//!     let message = builder.message("greeting");
//!     // ... call server.address():server.port() with `message` ...
//!     assert_eq!(server.received(), vec![message]);
//! }
//! ```

mod echo_server;

pub use echo_server::{ReceivedRequest, TestEchoServer};

use uuid::Uuid;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded random data.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_echo_round_trip");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic id, e.g. for `x-cluster-id`
    pub fn cluster_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Unique call name, so chaos rules from one test never match another's
    pub fn call_name(&self, method: &str) -> String {
        format!("{}-{}", method, self.seed)
    }

    /// Echo payload tagged with the test seed
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.message("hello"), "test-7-hello");
    /// ```
    pub fn message(&self, suffix: &str) -> String {
        format!("test-{}-{}", self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    use grpc_client::RpcStatus;

    /// Assert that a call succeeded
    pub fn assert_ok(status: &RpcStatus, context: &str) {
        assert!(
            status.is_ok(),
            "{}: expected OK, got {:?}: {}",
            context,
            status.code(),
            status.message()
        );
    }

    /// Assert that a call failed with `Unavailable`
    pub fn assert_unavailable(status: &RpcStatus, context: &str) {
        assert!(
            status.is_unavailable(),
            "{}: expected Unavailable, got {:?}: {}",
            context,
            status.code(),
            status.message()
        );
    }

    /// Assert that a call hit its deadline
    pub fn assert_deadline_exceeded(status: &RpcStatus, context: &str) {
        assert!(
            status.is_deadline_exceeded(),
            "{}: expected DeadlineExceeded, got {:?}: {}",
            context,
            status.code(),
            status.message()
        );
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
