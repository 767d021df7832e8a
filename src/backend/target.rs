//! Lifecycle bookkeeping for the compute target a backend holds.

use std::fmt;

use super::ProvisioningError;

/// Lifecycle state of a [`RemoteTarget`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TargetState {
    /// Creation was requested from the provider.
    Requested,
    /// The provider is booting or starting the target.
    Provisioning,
    /// The target accepts work.
    Ready,
    /// A step is executing on the target.
    Busy,
    /// Termination was requested.
    Terminating,
    /// The target no longer exists.
    Terminated,
    /// The target was stopped and retained.
    Stopped,
    /// The target failed to reach or keep a usable state.
    Failed,
}

impl TargetState {
    /// Returns `true` for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Stopped)
    }

    const fn allows(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Provisioning | Self::Failed)
                | (
                    Self::Provisioning | Self::Ready | Self::Busy,
                    Self::Terminating | Self::Stopped | Self::Failed
                )
                | (Self::Provisioning | Self::Busy, Self::Ready)
                | (Self::Ready, Self::Busy)
                | (Self::Terminating, Self::Terminated | Self::Failed)
                | (Self::Failed, Self::Terminating | Self::Stopped)
        )
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// How the backend came to hold a target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetOrigin {
    /// The target was created by this run and belongs to it.
    Created,
    /// The caller supplied an existing target.
    Reused {
        /// Whether the target was stopped before this run started it.
        was_stopped: bool,
    },
}

/// Compute target held by a backend for the duration of one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    id: String,
    state: TargetState,
    origin: TargetOrigin,
}

impl RemoteTarget {
    /// Tracks a target this run asked the provider to create.
    #[must_use]
    pub fn created(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: TargetState::Requested,
            origin: TargetOrigin::Created,
        }
    }

    /// Tracks a caller-supplied target. Running targets start `Ready`;
    /// stopped ones start `Provisioning` until they have been started.
    #[must_use]
    pub fn reused(id: impl Into<String>, was_stopped: bool) -> Self {
        let state = if was_stopped {
            TargetState::Provisioning
        } else {
            TargetState::Ready
        };
        Self {
            id: id.into(),
            state,
            origin: TargetOrigin::Reused { was_stopped },
        }
    }

    /// Provider identifier of the target.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TargetState {
        self.state
    }

    /// How the target was obtained.
    #[must_use]
    pub const fn origin(&self) -> TargetOrigin {
        self.origin
    }

    /// Returns `true` when the caller supplied the target.
    #[must_use]
    pub const fn is_reused(&self) -> bool {
        matches!(self.origin, TargetOrigin::Reused { .. })
    }

    /// Moves the target to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::InvalidTransition`] when the lifecycle does
    /// not permit the move; the state is left unchanged.
    pub fn transition(&mut self, next: TargetState) -> Result<(), ProvisioningError> {
        if !self.state.allows(next) {
            return Err(ProvisioningError::InvalidTransition {
                target: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Marks the target failed unless it already reached a final state.
    pub fn fail(&mut self) {
        if self.state.allows(TargetState::Failed) {
            self.state = TargetState::Failed;
        }
    }
}
