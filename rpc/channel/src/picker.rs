//! Pickers: the per-request routing decision published by a load balancer.

use crate::connectivity::ConnectivityState;
use crate::subchannel::SubchannelId;
use rpc_wire::Status;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Facts about the request being routed.
#[derive(Debug, Clone)]
pub struct PickInfo {
    /// Method path, `/<service>/<method>`.
    pub path: String,
}

/// Hooks a policy can attach to a completed pick to observe call lifetime
/// (used by wrapping policies for drop/overload accounting).
pub trait CallTracker {
    fn on_call_started(&self) {}
    fn on_call_ended(&self, _status: &Status) {}
}

/// Outcome of one pick.
pub enum PickResult {
    /// Route the call to this subchannel.
    Complete {
        subchannel: SubchannelId,
        tracker: Option<Arc<dyn CallTracker>>,
    },
    /// No decision yet; queue the call until a new picker is published.
    Queue,
    /// The channel is in a failing state; fail wait-for-ready=false calls.
    TransientFailure(Status),
    /// The policy dropped the call; fail it regardless of wait-for-ready.
    Drop(Status),
}

/// A routing decision function. One picker is immutable; policies publish a
/// new one whenever their view changes.
pub trait Picker {
    fn pick(&self, info: &PickInfo) -> PickResult;
}

/// Picker that queues every pick (CONNECTING / IDLE states).
pub struct QueuePicker;

impl Picker for QueuePicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Queue
    }
}

/// Picker that fails every pick with a fixed status (TRANSIENT_FAILURE).
pub struct FailPicker {
    status: Status,
}

impl FailPicker {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

impl Picker for FailPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::TransientFailure(self.status.clone())
    }
}

/// Picker wrapping an IDLE child: the first pick raises a latch the owner
/// turns into `exit_idle`, and the call queues meanwhile.
pub struct ExitIdleOnPick {
    latch: Arc<AtomicBool>,
}

impl ExitIdleOnPick {
    pub fn new(latch: Arc<AtomicBool>) -> Self {
        Self { latch }
    }
}

impl Picker for ExitIdleOnPick {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        self.latch.store(true, Ordering::Relaxed);
        PickResult::Queue
    }
}

/// A published load-balancer decision: aggregate state plus the picker that
/// goes with it.
#[derive(Clone)]
pub struct PickerUpdate {
    pub state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> PickInfo {
        PickInfo {
            path: "/svc/m".into(),
        }
    }

    #[test]
    fn test_queue_picker() {
        assert!(matches!(QueuePicker.pick(&info()), PickResult::Queue));
    }

    #[test]
    fn test_fail_picker_carries_status() {
        let picker = FailPicker::new(Status::unavailable("down"));
        match picker.pick(&info()) {
            PickResult::TransientFailure(status) => {
                assert_eq!(status.details(), "down");
            }
            _ => panic!("expected transient failure"),
        }
    }

    #[test]
    fn test_exit_idle_latch() {
        let latch = Arc::new(AtomicBool::new(false));
        let picker = ExitIdleOnPick::new(latch.clone());
        assert!(matches!(picker.pick(&info()), PickResult::Queue));
        assert!(latch.load(Ordering::Relaxed));
    }
}
