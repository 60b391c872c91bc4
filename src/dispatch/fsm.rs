//! Transition tables for the per-node state machines.
//!
//! Every (state, event) pair missing from a table is rejected with a
//! protocol violation; nothing falls through silently.

use crate::error::{DispatchError, DispatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    AwaitingGuestData,
    Running,
    AwaitingNextTest,
    Terminated,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmEvent {
    /// Configuration delivered and guest data (if requested) received.
    Start,
    /// A trace was harvested from the node.
    TraceQueued,
    /// The node went idle without producing a trace.
    Idle,
    /// A pooled test case was delivered.
    NextTest,
    Poll,
    Fail,
    Terminate,
}

impl VmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Terminated)
    }

    pub fn transition(self, event: VmEvent) -> DispatchResult<VmState> {
        use VmEvent as E;
        use VmState as S;

        let next = match (self, event) {
            (_, E::Terminate) => S::Terminated,
            (S::Terminated, _) => return Err(rejected(self, event)),
            (_, E::Fail) => S::Error,
            (S::AwaitingGuestData, E::Start) => S::Running,
            (S::Running, E::TraceQueued | E::Idle) => S::AwaitingNextTest,
            (S::Running, E::Poll) => S::Running,
            (S::AwaitingNextTest, E::NextTest) => S::Running,
            (S::AwaitingNextTest, E::Poll) => S::AwaitingNextTest,
            (S::Error, E::Poll) => S::Error,
            _ => return Err(rejected(self, event)),
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvmState {
    Idle,
    AwaitingTrace,
    Analyzing,
    TestsReady,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvmEvent {
    /// Configuration delivered, node commenced.
    Start,
    /// A pooled trace was delivered.
    NextTrace,
    /// The node reported pending test cases.
    TestsQueued,
    /// Pending test cases were harvested into the pool.
    TestsHarvested,
    Poll,
    Terminate,
}

impl SvmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SvmState::Terminated)
    }

    pub fn transition(self, event: SvmEvent) -> DispatchResult<SvmState> {
        use SvmEvent as E;
        use SvmState as S;

        let next = match (self, event) {
            (_, E::Terminate) => S::Terminated,
            (S::Terminated, _) => return Err(rejected(self, event)),
            (_, E::Poll) => self,
            (S::Idle, E::Start) => S::AwaitingTrace,
            (S::AwaitingTrace | S::Analyzing, E::NextTrace) => S::Analyzing,
            (S::AwaitingTrace | S::Analyzing, E::TestsQueued) => S::TestsReady,
            (S::TestsReady, E::TestsHarvested) => S::AwaitingTrace,
            _ => return Err(rejected(self, event)),
        };
        Ok(next)
    }
}

/// SVM state plus the flags that live beside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmMachine {
    pub state: SvmState,
    /// Set on any node-local failure. The primary state is left as it was;
    /// an errored node is no longer stepped.
    pub errored: bool,
    pub terminated: bool,
}

impl Default for SvmMachine {
    fn default() -> Self {
        Self {
            state: SvmState::Idle,
            errored: false,
            terminated: false,
        }
    }
}

impl SvmMachine {
    pub fn fire(&mut self, event: SvmEvent) -> DispatchResult<SvmState> {
        self.state = self.state.transition(event)?;
        if self.state == SvmState::Terminated {
            self.terminated = true;
        }
        Ok(self.state)
    }
}

/// Top-level dispatch states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Initializing,
    AwaitingRegistrations,
    Dispatching,
    Draining,
    Finished,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchState::Finished | DispatchState::Failed)
    }

    /// Whether the orchestrator may move from `self` to `next`.
    pub fn can_move_to(self, next: DispatchState) -> bool {
        use DispatchState as S;
        matches!(
            (self, next),
            (S::Initializing, S::AwaitingRegistrations)
                | (S::AwaitingRegistrations, S::Dispatching | S::Draining)
                | (S::Dispatching, S::Draining)
                | (S::Draining, S::Finished)
        ) || (next == S::Failed && !self.is_terminal())
    }
}

fn rejected(state: impl std::fmt::Debug, event: impl std::fmt::Debug) -> DispatchError {
    DispatchError::protocol(format!("event {:?} is not valid in state {:?}", event, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM_STATES: [VmState; 5] = [
        VmState::AwaitingGuestData,
        VmState::Running,
        VmState::AwaitingNextTest,
        VmState::Terminated,
        VmState::Error,
    ];
    const VM_EVENTS: [VmEvent; 7] = [
        VmEvent::Start,
        VmEvent::TraceQueued,
        VmEvent::Idle,
        VmEvent::NextTest,
        VmEvent::Poll,
        VmEvent::Fail,
        VmEvent::Terminate,
    ];
    const SVM_STATES: [SvmState; 5] = [
        SvmState::Idle,
        SvmState::AwaitingTrace,
        SvmState::Analyzing,
        SvmState::TestsReady,
        SvmState::Terminated,
    ];
    const SVM_EVENTS: [SvmEvent; 6] = [
        SvmEvent::Start,
        SvmEvent::NextTrace,
        SvmEvent::TestsQueued,
        SvmEvent::TestsHarvested,
        SvmEvent::Poll,
        SvmEvent::Terminate,
    ];

    #[test]
    fn test_vm_happy_path() {
        let mut s = VmState::AwaitingGuestData;
        for (event, expected) in [
            (VmEvent::Start, VmState::Running),
            (VmEvent::Poll, VmState::Running),
            (VmEvent::TraceQueued, VmState::AwaitingNextTest),
            (VmEvent::NextTest, VmState::Running),
            (VmEvent::Idle, VmState::AwaitingNextTest),
            (VmEvent::Terminate, VmState::Terminated),
        ] {
            s = s.transition(event).unwrap();
            assert_eq!(s, expected);
        }
    }

    #[test]
    fn test_vm_terminated_rejects_work() {
        let s = VmState::Terminated;
        assert!(matches!(
            s.transition(VmEvent::NextTest),
            Err(DispatchError::ProtocolViolation(_))
        ));
        assert!(s.transition(VmEvent::Start).is_err());
        assert_eq!(s.transition(VmEvent::Terminate).unwrap(), VmState::Terminated);
    }

    #[test]
    fn test_vm_table_is_exhaustive() {
        for s in VM_STATES {
            for e in VM_EVENTS {
                match s.transition(e) {
                    Ok(next) => {
                        if s == VmState::Terminated {
                            assert_eq!(e, VmEvent::Terminate);
                        }
                        if e == VmEvent::Fail {
                            assert_eq!(next, VmState::Error);
                        }
                    }
                    Err(err) => assert!(matches!(err, DispatchError::ProtocolViolation(_))),
                }
            }
            assert_eq!(s.transition(VmEvent::Terminate).unwrap(), VmState::Terminated);
        }
    }

    #[test]
    fn test_vm_rejects_out_of_order_events() {
        assert!(VmState::AwaitingGuestData.transition(VmEvent::NextTest).is_err());
        assert!(VmState::Running.transition(VmEvent::NextTest).is_err());
        assert!(VmState::AwaitingNextTest.transition(VmEvent::TraceQueued).is_err());
        assert!(VmState::Error.transition(VmEvent::NextTest).is_err());
    }

    #[test]
    fn test_svm_happy_path_and_flags() {
        let mut m = SvmMachine::default();
        m.fire(SvmEvent::Start).unwrap();
        assert_eq!(m.fire(SvmEvent::NextTrace).unwrap(), SvmState::Analyzing);
        assert_eq!(m.fire(SvmEvent::NextTrace).unwrap(), SvmState::Analyzing);
        assert_eq!(m.fire(SvmEvent::Poll).unwrap(), SvmState::Analyzing);
        m.errored = true;
        assert_eq!(m.fire(SvmEvent::TestsQueued).unwrap(), SvmState::TestsReady);
        assert_eq!(m.fire(SvmEvent::TestsHarvested).unwrap(), SvmState::AwaitingTrace);
        assert!(m.errored);
        m.fire(SvmEvent::Terminate).unwrap();
        assert!(m.terminated);
    }

    #[test]
    fn test_svm_terminated_rejects_work() {
        let mut m = SvmMachine::default();
        m.fire(SvmEvent::Terminate).unwrap();
        assert!(m.fire(SvmEvent::NextTrace).is_err());
        assert!(m.fire(SvmEvent::Poll).is_err());
        assert_eq!(m.state, SvmState::Terminated);
    }

    #[test]
    fn test_svm_table_is_exhaustive() {
        for s in SVM_STATES {
            for e in SVM_EVENTS {
                if let Err(err) = s.transition(e) {
                    assert!(matches!(err, DispatchError::ProtocolViolation(_)));
                }
            }
            assert_eq!(s.transition(SvmEvent::Terminate).unwrap(), SvmState::Terminated);
            if s != SvmState::Terminated {
                assert_eq!(s.transition(SvmEvent::Poll).unwrap(), s);
            }
        }
        assert!(SvmState::Idle.transition(SvmEvent::NextTrace).is_err());
        assert!(SvmState::TestsReady.transition(SvmEvent::NextTrace).is_err());
    }

    #[test]
    fn test_dispatch_state_moves() {
        use DispatchState as S;
        assert!(S::Initializing.can_move_to(S::AwaitingRegistrations));
        assert!(S::Dispatching.can_move_to(S::Draining));
        assert!(S::AwaitingRegistrations.can_move_to(S::Draining));
        assert!(S::Dispatching.can_move_to(S::Failed));
        assert!(!S::Dispatching.can_move_to(S::Finished));
        assert!(!S::Finished.can_move_to(S::Failed));
        assert!(!S::Draining.can_move_to(S::Dispatching));
    }
}
