//! Runtime state of process instances.

pub mod tree;

pub use tree::InstanceState;
