//! Core kernel for the host agent.
//!
//! The kernel owns the request router and everything it consults: the peer
//! connection cache, the service and manager registries, the central
//! registration state machine and the persisted stores.

pub mod background;
pub mod central;
pub mod config;
pub mod control;
pub mod credentials;
pub mod error;
pub mod install;
pub mod kernel;
pub mod keystore;
pub mod managers;
pub mod platform;
pub mod router;
pub mod rpc;
pub mod services;
pub mod settings;

#[cfg(test)]
mod testing;

pub use kernel::HostKernel;
pub use platform::PlatformAgent;
pub use router::{PlatformRouter, RouteTarget};
