#![forbid(unsafe_code)]

// Recording toggle - strict idle/recording state machine per room.
// Only the state transition lives here; no media is written.

use crate::media::types::{MediaError, MediaResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording { recording_id: String },
}

impl RecordingState {
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording { .. })
    }

    /// Transitions `idle -> recording`.
    ///
    /// # Errors
    /// Returns `InvalidState` if a recording is already running
    pub fn start(&mut self, recording_id: String) -> MediaResult<()> {
        match self {
            Self::Idle => {
                *self = Self::Recording { recording_id };
                Ok(())
            }
            Self::Recording { .. } => Err(MediaError::InvalidState("Already recording".to_string())),
        }
    }

    /// Transitions `recording -> idle`, returning the id the recording was started with.
    ///
    /// # Errors
    /// Returns `InvalidState` if nothing is being recorded
    pub fn stop(&mut self) -> MediaResult<String> {
        match std::mem::take(self) {
            Self::Recording { recording_id } => Ok(recording_id),
            Self::Idle => Err(MediaError::InvalidState("Not recording".to_string())),
        }
    }
}
