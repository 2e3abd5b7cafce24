//! Observability setup for tokenflow binaries.
//!
//! Library crates only emit `tracing` events; the binary decides where they
//! go by calling [`tracing_setup::init_tracing`] once at startup.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing, LogFormat, TracingOptions};
