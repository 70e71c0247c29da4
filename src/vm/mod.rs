//! Cloud VM provisioning.
//!
//! ```text
//! pending ─► provisioning ─► running ⇄ stopped
//!                 │              │        │
//!                 └──► error ◄───┴────────┘
//!                        │
//!  running|stopped|error ─► destroying ─► destroyed
//! ```

mod error;
mod provisioner;

pub use error::{ProvisionError, Result};
pub use provisioner::VmProvisioner;
