//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (tokenflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod runtime;

pub use memory::InMemoryRuntimeRepository;
pub use runtime::RuntimeRepository;
