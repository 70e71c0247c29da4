//! Resource state machines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap on recorded transitions per resource.
const MAX_TRANSITIONS: usize = 200;

/// Shared behavior of the per-resource state enums.
pub trait LifecycleState:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + Serialize + 'static
{
    /// Resource kind, for messages.
    const KIND: &'static str;

    /// The failure state.
    const ERROR: Self;

    fn can_transition_to(&self, target: Self) -> bool;

    /// No transitions leave this state.
    fn is_terminal(&self) -> bool;

    /// Reconciliation leaves the resource alone in this state.
    fn is_settled(&self) -> bool;

    /// An operation was underway; seeing this at retry time means the
    /// previous attempt died.
    fn is_in_progress(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot transition {kind} from {from} to {to}")]
pub struct TransitionError {
    pub kind: &'static str,
    pub from: String,
    pub to: String,
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// VM instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Error,
    Destroying,
    Destroyed,
}

impl LifecycleState for VmState {
    const KIND: &'static str = "vm";
    const ERROR: Self = Self::Error;

    fn can_transition_to(&self, target: Self) -> bool {
        use VmState::*;

        matches!(
            (self, target),
            (Pending, Provisioning)
                | (Provisioning, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                // retry after cleanup
                | (Error, Provisioning)
                | (Running | Stopped | Error, Destroying)
                | (Destroying, Destroyed)
        ) || (target == Error && !matches!(self, Error | Destroyed))
    }

    fn is_terminal(&self) -> bool {
        *self == Self::Destroyed
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Running | Self::Destroying | Self::Destroyed)
    }

    fn is_in_progress(&self) -> bool {
        *self == Self::Provisioning
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Deployment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Error,
    Destroying,
    Destroyed,
}

impl LifecycleState for DeploymentState {
    const KIND: &'static str = "deployment";
    const ERROR: Self = Self::Error;

    fn can_transition_to(&self, target: Self) -> bool {
        use DeploymentState::*;

        matches!(
            (self, target),
            (Pending, Deploying)
                | (Deploying, Running)
                // redeploy
                | (Running | Stopped | Error, Deploying)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Running)
                | (Running | Stopped | Error, Destroying)
                | (Destroying, Destroyed)
        ) || (target == Error && !matches!(self, Error | Destroyed))
    }

    fn is_terminal(&self) -> bool {
        *self == Self::Destroyed
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Running | Self::Destroying | Self::Destroyed)
    }

    fn is_in_progress(&self) -> bool {
        matches!(self, Self::Deploying | Self::Stopping)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Local sandbox lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Pending,
    Creating,
    Running,
    Stopped,
    Error,
    Destroying,
    Destroyed,
}

impl LifecycleState for SandboxState {
    const KIND: &'static str = "sandbox";
    const ERROR: Self = Self::Error;

    fn can_transition_to(&self, target: Self) -> bool {
        use SandboxState::*;

        matches!(
            (self, target),
            (Pending, Creating)
                | (Creating, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Error, Creating)
                | (Running | Stopped | Error, Destroying)
                | (Destroying, Destroyed)
        ) || (target == Error && !matches!(self, Error | Destroyed))
    }

    fn is_terminal(&self) -> bool {
        *self == Self::Destroyed
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Running | Self::Destroying | Self::Destroyed)
    }

    fn is_in_progress(&self) -> bool {
        *self == Self::Creating
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// State, history and failure detail shared by every resource record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lifecycle<S> {
    pub state: S,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition<S>>,
}

impl<S: LifecycleState> Lifecycle<S> {
    pub fn new(initial: S) -> Self {
        let now = Utc::now();
        Self {
            state: initial,
            error_message: None,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
        }
    }

    /// Validate and apply a transition. Every state change goes through here.
    pub fn transition(
        &mut self,
        to: S,
        reason: Option<String>,
    ) -> Result<StateTransition<S>, TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                kind: S::KIND,
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let transition = StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason,
        };
        self.transitions.push(transition.clone());
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = to;
        self.updated_at = transition.timestamp;
        if to != S::ERROR {
            self.error_message = None;
        }
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_transitions() {
        use VmState::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Error.can_transition_to(Provisioning));
        assert!(Error.can_transition_to(Destroying));
        assert!(!Pending.can_transition_to(Destroying));
        assert!(!Provisioning.can_transition_to(Destroying));
        assert!(!Destroyed.can_transition_to(Error));
        assert!(!Destroyed.can_transition_to(Provisioning));
        for s in [Pending, Provisioning, Running, Stopped, Destroying] {
            assert!(s.can_transition_to(Error), "{s} -> error");
        }
    }

    #[test]
    fn test_deployment_redeploy_and_stop() {
        use DeploymentState::*;
        assert!(Running.can_transition_to(Deploying));
        assert!(Error.can_transition_to(Deploying));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn test_settled_and_terminal() {
        assert!(VmState::Running.is_settled());
        assert!(VmState::Destroying.is_settled());
        assert!(!VmState::Error.is_settled());
        assert!(VmState::Destroyed.is_terminal());
        assert!(!VmState::Destroying.is_terminal());
        assert!(DeploymentState::Stopping.is_in_progress());
        assert!(SandboxState::Creating.is_in_progress());
    }

    #[test]
    fn test_lifecycle_transition_records_history() {
        let mut lc = Lifecycle::new(SandboxState::Pending);
        lc.transition(SandboxState::Creating, None).unwrap();
        lc.error_message = Some("boom".to_string());
        lc.transition(SandboxState::Error, Some("boom".to_string()))
            .unwrap();
        assert_eq!(lc.error_message.as_deref(), Some("boom"));
        lc.transition(SandboxState::Creating, Some("retry".to_string()))
            .unwrap();
        assert!(lc.error_message.is_none());
        assert_eq!(lc.transitions.len(), 3);
        assert_eq!(lc.transitions[1].to, SandboxState::Error);
    }

    #[test]
    fn test_invalid_transition_is_rejected_without_change() {
        let mut lc = Lifecycle::new(VmState::Destroyed);
        let err = lc.transition(VmState::Running, None).unwrap_err();
        assert_eq!(err.to_string(), "Cannot transition vm from destroyed to running");
        assert_eq!(lc.state, VmState::Destroyed);
        assert!(lc.transitions.is_empty());
    }

    #[test]
    fn test_transition_history_capped() {
        let mut lc = Lifecycle::new(VmState::Pending);
        lc.transition(VmState::Provisioning, None).unwrap();
        lc.transition(VmState::Running, None).unwrap();
        for _ in 0..150 {
            lc.transition(VmState::Stopped, None).unwrap();
            lc.transition(VmState::Running, None).unwrap();
        }
        assert_eq!(lc.transitions.len(), MAX_TRANSITIONS);
        assert_eq!(lc.state, VmState::Running);
    }
}
