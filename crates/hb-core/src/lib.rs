//! Core types for hybrid-bridge: the shared service/tunnel state store that
//! every other crate reports into, and the TOML-backed configuration.

pub mod config;
pub mod state;
