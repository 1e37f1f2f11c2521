//! Deterministic, pure logic shared by the runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (stories, captured output, diff statistics) and return deterministic
//! outputs suitable for tests.

pub mod activity;
pub mod classifier;
pub mod events;
pub mod retry;
pub mod selector;
pub mod types;
pub mod verifier;
