//! Pure decision logic for the status poller.
//!
//! [`transition`] maps `(state, event)` to the next state plus a list of
//! effects. It never touches timers or the network; the runner executes the
//! effects in order.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Checking,
    Idle,
    Active,
}

impl PollState {
    pub fn label(self) -> &'static str {
        match self {
            PollState::Checking => "checking",
            PollState::Idle => "idle",
            PollState::Active => "active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    StatusReported { is_active: bool },
    StatusFailed(String),
    TriggerAccepted,
    /// The trigger was rejected because an execution is already running.
    TriggerConflict,
    TriggerFailed(String),
    DismissError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ClearTimer,
    ArmTimer(Duration),
    CheckNow,
    ShowError(String),
    ClearError,
}

/// Poll cadence per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPeriods {
    pub active: Duration,
    pub idle: Duration,
}

impl Default for PollPeriods {
    fn default() -> Self {
        Self {
            active: Duration::from_secs(5),
            idle: Duration::from_secs(30),
        }
    }
}

impl PollPeriods {
    /// `None` while checking: the initial check is issued directly.
    pub fn for_state(&self, state: PollState) -> Option<Duration> {
        match state {
            PollState::Checking => None,
            PollState::Idle => Some(self.idle),
            PollState::Active => Some(self.active),
        }
    }
}

pub fn transition(state: PollState, event: PollEvent, periods: &PollPeriods) -> (PollState, Vec<Effect>) {
    use PollState::*;

    let (next, mut effects) = match (state, event) {
        (_, PollEvent::StatusReported { is_active }) => {
            (if is_active { Active } else { Idle }, Vec::new())
        }
        // A failed first check settles in idle instead of retrying in a loop.
        (Checking, PollEvent::StatusFailed(msg)) => (Idle, vec![Effect::ShowError(msg)]),
        (s, PollEvent::StatusFailed(msg)) => (s, vec![Effect::ShowError(msg)]),
        (s, PollEvent::TriggerAccepted) => (s, vec![Effect::ClearError, Effect::CheckNow]),
        // Someone else started the job: show progress without waiting for the idle tick.
        (Idle, PollEvent::TriggerConflict) => (Active, Vec::new()),
        (s, PollEvent::TriggerConflict) => (s, Vec::new()),
        (s, PollEvent::TriggerFailed(msg)) => (s, vec![Effect::ShowError(msg)]),
        (s, PollEvent::DismissError) => (s, vec![Effect::ClearError]),
    };

    if next != state {
        let mut rearm = vec![Effect::ClearTimer];
        if let Some(period) = periods.for_state(next) {
            rearm.push(Effect::ArmTimer(period));
        }
        rearm.append(&mut effects);
        effects = rearm;
    }

    (next, effects)
}
