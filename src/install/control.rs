use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Cooperative run state shared by every phase of an installer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Paused,
    Cancelling,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Paused,
            2 => RunState::Cancelling,
            _ => RunState::Running,
        }
    }
}

#[derive(Debug)]
pub struct ControlState(AtomicU8);

impl Default for ControlState {
    fn default() -> Self {
        Self(AtomicU8::new(RunState::Running as u8))
    }
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_paused(&self) -> bool {
        self.get() == RunState::Paused
    }

    pub fn is_cancelling(&self) -> bool {
        self.get() == RunState::Cancelling
    }

    /// Flips Running <-> Paused and returns whether we are now paused.
    /// Once cancelling, the state is sticky and this returns false.
    pub fn toggle_pause(&self) -> bool {
        let result = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
            match RunState::from_u8(value) {
                RunState::Running => Some(RunState::Paused as u8),
                RunState::Paused => Some(RunState::Running as u8),
                RunState::Cancelling => None,
            }
        });
        matches!(result, Ok(previous) if RunState::from_u8(previous) == RunState::Running)
    }

    /// Enter cancelling; this also releases any pause
    pub fn cancel(&self) {
        self.0.store(RunState::Cancelling as u8, Ordering::Release);
    }
}
