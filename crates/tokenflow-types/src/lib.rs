//! Shared domain types for tokenflow.
//!
//! This crate contains the types used across the engine: the process
//! definition IR, runtime entities of a process instance (executions, tasks,
//! jobs, variables, event subscriptions), engine events, configuration, and
//! repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod process;
pub mod runtime;
