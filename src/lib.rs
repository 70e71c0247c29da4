//! infracore: lifecycle engine for local sandboxes, cloud VMs and container
//! deployments.
//!
//! The engine talks to a container runtime (local socket or a VM's mesh
//! address), a cloud compute API, a mesh-network control plane, a
//! reverse-proxy admin API and remote shells, and drives each resource
//! through create, provision, run, stop and destroy. Every entry point is
//! safe to re-invoke after a partial failure; see [`lifecycle::Reconciler`].

pub mod cli;
pub mod cloud;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod keys;
pub mod lifecycle;
pub mod maintenance;
pub mod mesh;
pub mod model;
pub mod proxy;
pub mod runtime;
pub mod sandbox;
pub mod ssh;
pub mod store;
pub mod testing;
pub mod vm;

pub use config::Config;
pub use error::{Error, Result};
