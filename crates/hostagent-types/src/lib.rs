//! Core types for the host control-plane agent.
//!
//! This crate defines the data structures shared by the wire layer, the
//! router kernel and the CLI. It contains no business logic.

pub mod agent;
pub mod capability;
pub mod config;
pub mod error;
pub mod platform;
