//! Host session state machine (spec §4.4).
//!
//! Ported from `moonraker.py::Server._initialize`/`_check_ready`/
//! `_verify_klippy_requirements`. The idempotent "init list" is modeled
//! as a `HashSet<InitStep>` rather than free-form strings, since the
//! steps are a fixed, known set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};

/// Objects the host is expected to expose; missing ones are a warning,
/// not fatal (spec §4.4).
pub const REQUIRED_HOST_OBJECTS: &[&str] = &["virtual_sdcard", "display_status", "pause_resume"];

/// Log the "still initializing" message every 8th attempt for the first
/// 80 attempts, matching `LOG_ATTEMPT_INTERVAL`/`MAX_LOG_ATTEMPTS`.
pub const LOG_ATTEMPT_INTERVAL: u32 = 8;
pub const MAX_LOG_ATTEMPTS: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Identified = 3,
    Ready = 4,
    Shutdown = 5,
}

impl HostState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Identified,
            4 => Self::Ready,
            _ => Self::Shutdown,
        }
    }

    /// Pending RPC requests may only exist in these states (spec §3).
    pub fn accepts_requests(self) -> bool {
        matches!(self, Self::Connected | Self::Identified | Self::Ready)
    }
}

/// Atomically-readable current state, shared across the connect loop,
/// the multiplexer, and `/server/info`.
#[derive(Default)]
pub struct HostStateCell(AtomicU8);

impl HostStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(HostState::Disconnected as u8))
    }

    pub fn get(&self) -> HostState {
        HostState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: HostState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Steps in the idempotent initialization sequence. Re-initialization
/// (after a reconnect) skips any step whose marker is already present;
/// an explicit shutdown clears the whole set so the next start-up
/// re-runs everything, matching the source's `init_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitStep {
    Identified,
    KlippyReady,
    Webhooks,
    GcodeOutput,
    Endpoints,
}

#[derive(Default)]
pub struct InitList(parking_lot::Mutex<HashSet<InitStep>>);

impl InitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, step: InitStep) -> bool {
        self.0.lock().contains(&step)
    }

    pub fn mark(&self, step: InitStep) {
        self.0.lock().insert(step);
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Checks the host's reported object list against the objects this
/// gateway depends on. Returns the missing ones (never fatal — callers
/// just warn).
pub fn missing_required_objects(reported: &[String]) -> Vec<&'static str> {
    REQUIRED_HOST_OBJECTS
        .iter()
        .copied()
        .filter(|required| !reported.iter().any(|r| r == required))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_list_is_idempotent_until_cleared() {
        let list = InitList::new();
        assert!(!list.contains(InitStep::KlippyReady));
        list.mark(InitStep::KlippyReady);
        assert!(list.contains(InitStep::KlippyReady));
        list.clear();
        assert!(!list.contains(InitStep::KlippyReady));
    }

    #[test]
    fn missing_objects_reports_only_absent_ones() {
        let reported = vec!["virtual_sdcard".to_string(), "toolhead".to_string()];
        let missing = missing_required_objects(&reported);
        assert_eq!(missing, vec!["display_status", "pause_resume"]);
    }

    #[test]
    fn only_connected_identified_ready_accept_requests() {
        assert!(!HostState::Disconnected.accepts_requests());
        assert!(!HostState::Connecting.accepts_requests());
        assert!(HostState::Connected.accepts_requests());
        assert!(HostState::Identified.accepts_requests());
        assert!(HostState::Ready.accepts_requests());
        assert!(!HostState::Shutdown.accepts_requests());
    }
}
