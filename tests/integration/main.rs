//! Integration test binary: all integration tests share one binary.

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod helpers;

mod retrieval;
mod session;
