//! Process definitions: parsing, validation, executable graphs and the
//! deployed-definition cache.

pub mod cache;
pub mod definition;
pub mod graph;

pub use cache::DefinitionCache;
pub use graph::{FlowElement, FlowNode, ProcessGraph, SequenceFlow};
