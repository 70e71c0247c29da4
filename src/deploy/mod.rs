//! Application deployments onto a VM's container engine.
//!
//! Each deployment runs two containers on a private network: the
//! application and its database, which the application reaches by a
//! deterministic alias. The application is published on a host port that
//! is unique per VM and stable across redeploys.
//!
//! ```text
//!                 VM (mesh address)
//!   ┌──────────────────────────────────────────────┐
//!   │  caddy :443 ──► 127.0.0.1:<port>             │
//!   │                     │                        │
//!   │   deploy-<id>-net   ▼                        │
//!   │   ┌──────────────────────────────────────┐   │
//!   │   │ deploy-<id>-app ──► db-<id> (postgres)│   │
//!   │   └──────────────────────────────────────┘   │
//!   └──────────────────────────────────────────────┘
//! ```

mod error;
mod orchestrator;

pub use error::{DeployError, Result};
pub use orchestrator::DeployOrchestrator;
