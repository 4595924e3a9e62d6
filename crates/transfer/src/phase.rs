//! Session lifecycle.
//!
//! One transfer per session. The channel opening moves the session to
//! `Ready`; `file-start` (emitted or received) moves it to
//! `Transferring`; the `transfer-complete` exchange ends in `Done`.
//! Channel loss or a fatal error lands in `Interrupted` from any
//! non-terminal phase.

use tracing::debug;

/// Which side of the transfer this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Ready,
    Transferring,
    Done,
    Interrupted,
}

/// Illegal phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid {role:?} session transition {from:?} -> {to:?}")]
pub struct StateError {
    pub role: Role,
    pub from: Phase,
    pub to: Phase,
}

/// The session state machine shared by both pipelines.
#[derive(Debug)]
pub struct SessionState {
    role: Role,
    phase: Phase,
}

impl SessionState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Interrupted)
    }

    /// Idle -> Ready: the channel is open.
    pub fn channel_open(&mut self) -> Result<(), StateError> {
        self.advance(Phase::Idle, Phase::Ready)
    }

    /// Ready -> Transferring: `file-start` emitted or received.
    pub fn begin_transfer(&mut self) -> Result<(), StateError> {
        self.advance(Phase::Ready, Phase::Transferring)
    }

    /// Transferring -> Done: `transfer-complete` exchanged.
    pub fn complete(&mut self) -> Result<(), StateError> {
        self.advance(Phase::Transferring, Phase::Done)
    }

    /// Any non-terminal phase -> Interrupted. A session that already
    /// finished stays Done; interrupting twice is a no-op.
    pub fn interrupt(&mut self) {
        if !self.is_terminal() {
            debug!(role = ?self.role, from = ?self.phase, "session interrupted");
            self.phase = Phase::Interrupted;
        }
    }

    fn advance(&mut self, from: Phase, to: Phase) -> Result<(), StateError> {
        if self.phase != from {
            return Err(StateError {
                role: self.role,
                from: self.phase,
                to,
            });
        }
        debug!(role = ?self.role, ?from, ?to, "session transition");
        self.phase = to;
        Ok(())
    }
}
