//! Infrastructure layer for Conductor.
//!
//! Contains the adapters around `conductor-core`: the `conductor.toml`
//! loader, YAML workflow definitions, the SQLite implementation of the
//! engine-state repository, and process bootstrap.

pub mod bootstrap;
pub mod config;
pub mod definition;
pub mod sqlite;
