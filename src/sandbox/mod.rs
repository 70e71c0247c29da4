//! Local development sandboxes.
//!
//! A sandbox is one long-lived container on the local engine, attached to
//! its own network, that callers exec commands in and move files through.
//!
//! ```text
//! pending ─► creating ─► running ⇄ stopped
//!               │           │         │
//!               └─► error ◄─┴─────────┘
//!                     │
//!  running|stopped|error ─► destroying ─► destroyed
//! ```

mod error;
mod manager;

pub use error::{Result, SandboxError};
pub use manager::{SandboxManager, SandboxRequest};
