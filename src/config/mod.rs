// src/config/mod.rs

//! Configuration loading and validation for pgflow.
//!
//! - [`model`] is the TOML-backed data model.
//! - [`loader`] reads a config file from disk.
//! - [`validate`] turns a raw file into a [`ConfigFile`] with a compiled flow.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ClientSection, ConfigFile, FlowSection, RawConfigFile, StepConfig, WorkerSection};
