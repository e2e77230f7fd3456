//! Edgefleet: a terminal console for fleets of containerized edge nodes.
//!
//! This library exposes the core modules for use by the binary and by tests.

pub mod error;
pub mod config;
pub mod settings;
pub mod engine;
pub mod registry;
pub mod naming;
pub mod pull;
pub mod lifecycle;
pub mod control;
pub mod telemetry;
pub mod updater;
pub mod session;
pub mod view;
pub mod app;

pub use error::{Error, Result};
