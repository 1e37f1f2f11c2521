//! Stable exit codes for `story-runner` commands.

/// Command succeeded, or the job completed.
pub const OK: i32 = 0;
/// Invalid config, missing or malformed story file, or any other error.
pub const INVALID: i32 = 1;
/// `story-runner next` found no eligible story.
pub const NO_STORY: i32 = 2;
/// The job ended as failed.
pub const FAILED: i32 = 3;
/// The job was cancelled (SIGINT/SIGTERM).
pub const CANCELLED: i32 = 4;
