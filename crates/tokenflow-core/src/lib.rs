//! Process interpreter and engine facade for tokenflow.
//!
//! The interpreter advances process instances by draining an agenda of
//! operations against an in-memory execution tree. `ProcessEngine` wraps it
//! in units of work over a `RuntimeRepository` port; this crate depends only
//! on `tokenflow-types` and never on a storage technology.

pub mod agenda;
pub mod behavior;
pub mod context;
pub mod engine;
pub mod error;
pub mod error_propagation;
pub mod event;
pub mod expression;
pub mod job;
pub mod listener;
pub mod operation;
pub mod process;
pub mod repository;
pub mod runtime;
pub mod service;

#[cfg(test)]
mod test_support;

pub use engine::{ProcessEngine, SignalDelivery, StartProcessInstance};
pub use error::EngineError;
