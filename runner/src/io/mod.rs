//! I/O adapters: filesystem, git, processes and collaborators.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod executor;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod prd;
pub mod process;
pub mod stall;
pub mod supervisor;
pub mod validation;
