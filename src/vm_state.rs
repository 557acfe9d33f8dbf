//! Shared vocabulary for VM lifecycle state.
//!
//! `VmState` is the single source of truth for where a VM is in its lifecycle.
//! It is persisted on every `VmRecord` and only ever advanced through
//! `can_transition_to`, which encodes the allowed partial order.

use serde::{Deserialize, Serialize};

/// The persisted VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    /// Name reserved, nothing validated or created yet.
    Pending,

    /// Disk images are being written.
    ImagePreparing,

    /// The domain is being defined in the control plane.
    Creating,

    /// The domain is defined and being booted.
    Starting,

    /// The domain is up.
    Running,

    /// The domain is defined but shut off after an explicit stop.
    Stopped,

    /// The attempt ended in an error. The name can be resubmitted.
    Failed,

    /// Torn down. Records in this state are removed from the inventory.
    Deleted,
}

impl VmState {
    /// States an attempt passes through on the way to `Running`.
    pub fn is_provisioning(self) -> bool {
        matches!(
            self,
            VmState::Pending | VmState::ImagePreparing | VmState::Creating | VmState::Starting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Deleted)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Forward edges follow the provisioning pipeline; the only backward
    /// edges are "anything → Failed" and "Failed → Pending" (resubmission).
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        if self == Deleted {
            return false;
        }
        match (self, next) {
            (_, Deleted) => true,
            (Failed, Failed) => false,
            (_, Failed) => true,
            (Pending, ImagePreparing)
            | (ImagePreparing, Creating)
            | (Creating, Starting)
            | (Starting, Running)
            | (Running, Stopped)
            | (Stopped, Starting)
            | (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VmState::*;

    const ALL: [VmState; 8] = [
        Pending,
        ImagePreparing,
        Creating,
        Starting,
        Running,
        Stopped,
        Failed,
        Deleted,
    ];

    #[test]
    fn happy_path_is_allowed() {
        let path = [Pending, ImagePreparing, Creating, Starting, Running, Stopped, Starting];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn no_backward_edges_except_failed() {
        assert!(!Running.can_transition_to(Creating));
        assert!(!Starting.can_transition_to(ImagePreparing));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(Running.can_transition_to(Failed));
        assert!(Creating.can_transition_to(Failed));
    }

    #[test]
    fn failed_only_resubmits_or_deletes() {
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Deleted));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Starting));
    }

    #[test]
    fn every_live_state_can_be_deleted() {
        for state in ALL.into_iter().filter(|s| *s != Deleted) {
            assert!(state.can_transition_to(Deleted), "{state:?} -> Deleted");
        }
    }

    #[test]
    fn deleted_is_a_sink() {
        for state in ALL {
            assert!(!Deleted.can_transition_to(state));
        }
        assert!(Deleted.is_terminal());
    }

    #[test]
    fn provisioning_states() {
        assert!(Pending.is_provisioning());
        assert!(Starting.is_provisioning());
        assert!(!Running.is_provisioning());
        assert!(!Failed.is_provisioning());
    }

    #[test]
    fn serializes_as_variant_name() {
        assert_eq!(serde_json::to_string(&ImagePreparing).unwrap(), "\"ImagePreparing\"");
    }
}
