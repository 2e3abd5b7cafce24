//! Infrastructure layer for tokenflow.
//!
//! Contains the SQLite implementation of the `RuntimeRepository` port defined
//! in `tokenflow-core`, the data-directory layout, and the `config.toml`
//! loader.

pub mod config;
pub mod filesystem;
pub mod sqlite;
