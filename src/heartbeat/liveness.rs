//! Per-node liveness state machine
//!
//! ```text
//!            first valid heartbeat
//!   Idle ─────────────────────────────► Emitting
//!                                       │    ▲
//!        stale slot / skew / replay /   │    │ window with valid heartbeats
//!        silent window                  ▼    │ and no violation
//!                                     Suspected { missed }
//!                                       │
//!        missed == M silent windows     ▼
//!                                     Excluded ── readmit(floor) ──► Emitting
//! ```
//!
//! `Excluded` is left only through [`NodeLiveness::readmit`]; nothing
//! automatic moves a node out of it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessState {
    Idle,
    Emitting,
    /// `missed`: consecutive closed windows without a valid heartbeat
    Suspected { missed: u32 },
    Excluded,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("IDLE"),
            Self::Emitting => f.write_str("EMITTING"),
            Self::Suspected { missed } => write!(f, "SUSPECTED({missed})"),
            Self::Excluded => f.write_str("EXCLUDED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LivenessState,
    pub to: LivenessState,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadmitError {
    #[error("node is {0}, not excluded")]
    NotExcluded(LivenessState),
    /// The new sequence range must start above everything already accepted
    #[error("sequence floor {floor} is not above last accepted {last_accepted}")]
    FloorNotFresh { floor: u64, last_accepted: u64 },
}

/// Liveness of one node plus what happened to it in the open window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLiveness {
    state: LivenessState,
    valid_in_window: u32,
    violated_in_window: bool,
}

impl Default for NodeLiveness {
    fn default() -> Self {
        Self { state: LivenessState::Idle, valid_in_window: 0, violated_in_window: false }
    }
}

impl NodeLiveness {
    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn is_excluded(&self) -> bool {
        self.state == LivenessState::Excluded
    }

    /// Suspected at any point of the open window
    pub fn suspect_this_window(&self) -> bool {
        self.violated_in_window || matches!(self.state, LivenessState::Suspected { .. })
    }

    pub fn valid_in_window(&self) -> u32 {
        self.valid_in_window
    }

    fn set(&mut self, to: LivenessState) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(Transition { from, to })
    }

    pub fn on_valid_heartbeat(&mut self) -> Option<Transition> {
        self.valid_in_window = self.valid_in_window.saturating_add(1);
        match self.state {
            LivenessState::Idle => self.set(LivenessState::Emitting),
            _ => None,
        }
    }

    /// Stale slot, clock skew, replay or a forged PoH reference
    pub fn on_violation(&mut self) -> Option<Transition> {
        self.violated_in_window = true;
        match self.state {
            LivenessState::Idle | LivenessState::Emitting => self.set(LivenessState::Suspected { missed: 0 }),
            _ => None,
        }
    }

    /// Settle the window; `exclude_after` is M.
    pub fn close_window(&mut self, exclude_after: u32) -> Option<Transition> {
        let had_valid = self.valid_in_window > 0;
        let violated = self.violated_in_window;
        self.valid_in_window = 0;
        self.violated_in_window = false;

        match self.state {
            LivenessState::Emitting if !had_valid => self.set(LivenessState::Suspected { missed: 1 }),
            LivenessState::Suspected { missed } if !had_valid => {
                let missed = missed.saturating_add(1);
                if missed >= exclude_after {
                    self.set(LivenessState::Excluded)
                } else {
                    self.set(LivenessState::Suspected { missed })
                }
            }
            LivenessState::Suspected { .. } if violated => self.set(LivenessState::Suspected { missed: 0 }),
            LivenessState::Suspected { .. } => self.set(LivenessState::Emitting),
            _ => None,
        }
    }

    pub fn readmit(&mut self, floor: u64, last_accepted: u64) -> Result<Transition, ReadmitError> {
        if self.state != LivenessState::Excluded {
            return Err(ReadmitError::NotExcluded(self.state));
        }
        if floor <= last_accepted {
            return Err(ReadmitError::FloorNotFresh { floor, last_accepted });
        }
        self.valid_in_window = 0;
        self.violated_in_window = false;
        let from = self.state;
        self.state = LivenessState::Emitting;
        Ok(Transition { from, to: self.state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_to_emitting() {
        let mut n = NodeLiveness::default();
        assert_eq!(n.state(), LivenessState::Idle);
        n.on_valid_heartbeat();
        assert_eq!(n.state(), LivenessState::Emitting);
        assert_eq!(n.close_window(3), None);
    }

    #[test]
    fn test_violation_suspects_for_the_window() {
        let mut n = NodeLiveness::default();
        n.on_valid_heartbeat();
        let t = n.on_violation().unwrap();
        assert_eq!(t.to, LivenessState::Suspected { missed: 0 });
        assert!(n.suspect_this_window());
        n.on_valid_heartbeat();
        // valid heartbeats but a violation in the same window: still suspected
        n.close_window(3);
        assert_eq!(n.state(), LivenessState::Suspected { missed: 0 });
        // clean window: recovers
        n.on_valid_heartbeat();
        assert_eq!(n.close_window(3).map(|t| t.to), Some(LivenessState::Emitting));
    }

    #[test]
    fn test_exclusion_after_m_silent_windows() {
        let mut n = NodeLiveness::default();
        n.on_valid_heartbeat();
        n.on_violation();
        n.close_window(3); // violated, had valid: stays Suspected{0}
        n.close_window(3);
        assert_eq!(n.state(), LivenessState::Suspected { missed: 1 });
        n.close_window(3);
        assert_eq!(n.state(), LivenessState::Suspected { missed: 2 });
        n.close_window(3);
        assert_eq!(n.state(), LivenessState::Excluded);
        // nothing automatic leaves Excluded
        n.on_valid_heartbeat();
        n.close_window(3);
        assert!(n.is_excluded());
    }

    #[test]
    fn test_silent_emitter_times_out() {
        let mut n = NodeLiveness::default();
        n.on_valid_heartbeat();
        n.close_window(3);
        assert_eq!(n.close_window(3).map(|t| t.to), Some(LivenessState::Suspected { missed: 1 }));
    }

    #[test]
    fn test_readmit() {
        let mut n = NodeLiveness::default();
        assert_eq!(n.readmit(10, 5), Err(ReadmitError::NotExcluded(LivenessState::Idle)));
        n.on_valid_heartbeat();
        for _ in 0..4 {
            n.close_window(3);
        }
        assert!(n.is_excluded());
        assert_eq!(n.readmit(5, 5), Err(ReadmitError::FloorNotFresh { floor: 5, last_accepted: 5 }));
        assert_eq!(n.readmit(6, 5).map(|t| t.to), Ok(LivenessState::Emitting));
    }
}
