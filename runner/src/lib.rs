//! Unattended, iterative coding-agent runner.
//!
//! A job repeatedly picks the next incomplete story from `.runner/prd.json`,
//! spawns an external coding agent for it, runs the validation command,
//! verifies that the change is real work and commits it, or records why not.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, retry policy,
//!   selection, event decoding, verification). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, git, process supervision,
//!   collaborators). Traits at the seams so tests can script them.
//!
//! [`iteration`] runs one attempt at one story; [`job`] sequences attempts
//! for one working directory.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod job;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
