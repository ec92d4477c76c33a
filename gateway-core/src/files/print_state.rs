//! Print-state derivation (spec §4.11): a shared contract that turns
//! successive `print_stats` snapshots into `print-start`/`print-pause`/
//! `print-resume`/`print-finish`/`print-cancel` events.
//!
//! No single original file owns this transition table — it's assembled
//! from rules independently re-derived by several original plugins
//! (`history.py`, `filament_manager.py`). This module gives it one
//! authoritative home so every state-observing component shares it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PrintStatsSnapshot {
    pub state: PrintState,
    pub filename: String,
    pub total_duration: f64,
}

/// An event derived from a print-stats transition, in emission order
/// (a cancel-then-start pair is returned as two events).
#[derive(Debug, Clone, PartialEq)]
pub enum PrintEvent {
    Start,
    Pause,
    Resume,
    Cancel { previous: PrintState },
    Finish { reason: FinishReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Error,
    Cancelled,
    HostDisconnect,
    HostShutdown,
}

impl FinishReason {
    fn from_state(state: PrintState) -> Self {
        match state {
            PrintState::Complete => Self::Complete,
            PrintState::Error => Self::Error,
            _ => Self::Cancelled,
        }
    }
}

/// Derives the ordered list of events for a `previous -> new` transition,
/// per the rules in spec §4.11. Returns an empty vec for transitions with
/// no semantic meaning (e.g. standby -> standby).
pub fn derive_events(previous: &PrintStatsSnapshot, new: &PrintStatsSnapshot) -> Vec<PrintEvent> {
    use PrintState::*;

    let was_active = matches!(previous.state, Printing | Paused);

    if was_active && new.state == Printing {
        let restarted = new.filename != previous.filename
            || new.total_duration < previous.total_duration
            || previous.state != Paused;
        if restarted {
            return vec![PrintEvent::Cancel { previous: previous.state }, PrintEvent::Start];
        }
        return vec![];
    }

    match (previous.state, new.state) {
        (Standby | Complete | Error | Cancelled, Printing) => vec![PrintEvent::Start],
        (Printing, Paused) => vec![PrintEvent::Pause],
        (Paused, Printing) => vec![PrintEvent::Resume],
        (Printing | Paused, Standby) => vec![PrintEvent::Finish { reason: FinishReason::Cancelled }],
        (Printing | Paused, finished @ (Complete | Error | Cancelled)) => {
            vec![PrintEvent::Finish { reason: FinishReason::from_state(finished) }]
        }
        _ => vec![],
    }
}

/// Host disconnect/shutdown while a print was active (spec §4.11's last
/// two rules), called directly by the host session state machine rather
/// than through `derive_events` since there is no "new" snapshot.
pub fn derive_host_loss_event(previous: PrintState, shutdown: bool) -> Option<PrintEvent> {
    if matches!(previous, PrintState::Printing | PrintState::Paused) {
        Some(PrintEvent::Finish {
            reason: if shutdown { FinishReason::HostShutdown } else { FinishReason::HostDisconnect },
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(state: PrintState, filename: &str, duration: f64) -> PrintStatsSnapshot {
        PrintStatsSnapshot { state, filename: filename.to_string(), total_duration: duration }
    }

    #[test]
    fn standby_to_printing_is_start() {
        let events = derive_events(&snap(PrintState::Standby, "", 0.0), &snap(PrintState::Printing, "a.gcode", 0.0));
        assert_eq!(events, vec![PrintEvent::Start]);
    }

    #[test]
    fn printing_to_paused_is_pause() {
        let events = derive_events(
            &snap(PrintState::Printing, "a.gcode", 10.0),
            &snap(PrintState::Paused, "a.gcode", 10.0),
        );
        assert_eq!(events, vec![PrintEvent::Pause]);
    }

    #[test]
    fn paused_to_printing_same_file_is_resume() {
        let events = derive_events(
            &snap(PrintState::Paused, "a.gcode", 10.0),
            &snap(PrintState::Printing, "a.gcode", 10.0),
        );
        assert_eq!(events, vec![PrintEvent::Resume]);
    }

    #[test]
    fn printing_different_file_while_printing_is_cancel_then_start() {
        let events = derive_events(
            &snap(PrintState::Printing, "a.gcode", 10.0),
            &snap(PrintState::Printing, "b.gcode", 0.0),
        );
        assert_eq!(events, vec![PrintEvent::Cancel { previous: PrintState::Printing }, PrintEvent::Start]);
    }

    #[test]
    fn printing_to_standby_is_finish_cancelled() {
        let events = derive_events(
            &snap(PrintState::Printing, "a.gcode", 10.0),
            &snap(PrintState::Standby, "", 0.0),
        );
        assert_eq!(events, vec![PrintEvent::Finish { reason: FinishReason::Cancelled }]);
    }

    #[test]
    fn printing_to_complete_is_finish_complete() {
        let events = derive_events(
            &snap(PrintState::Printing, "a.gcode", 10.0),
            &snap(PrintState::Complete, "a.gcode", 20.0),
        );
        assert_eq!(events, vec![PrintEvent::Finish { reason: FinishReason::Complete }]);
    }

    #[test]
    fn host_disconnect_while_printing_is_finish_host_disconnect() {
        let event = derive_host_loss_event(PrintState::Printing, false);
        assert_eq!(event, Some(PrintEvent::Finish { reason: FinishReason::HostDisconnect }));
    }

    #[test]
    fn host_shutdown_while_standby_is_none() {
        let event = derive_host_loss_event(PrintState::Standby, true);
        assert_eq!(event, None);
    }
}
