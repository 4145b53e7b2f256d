//! Stored trigger records: a trigger plus its cluster-visible state and owner.

use crate::trigger::Trigger;
use chime_core::{JobKey, NodeAddress, TriggerKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Internal lifecycle state of a stored trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Eligible for acquisition.
    Waiting,
    /// Claimed by a node for an upcoming firing.
    Acquired,
    /// Fired; its job is running on the owning node.
    Executing,
    /// Finished; will not fire again.
    Complete,
    /// Paused by request.
    Paused,
    /// Held back while its non-concurrent job runs elsewhere.
    Blocked,
    /// Paused and blocked.
    PausedBlocked,
    /// Failed; needs an explicit reset.
    Error,
}

impl TriggerState {
    /// Returns whether the state carries an owning node.
    #[must_use]
    pub fn is_held(self) -> bool {
        matches!(self, Self::Acquired | Self::Executing)
    }

    /// Initial state for a newly stored or reset trigger.
    #[must_use]
    pub fn resting(paused: bool, blocked: bool) -> Self {
        match (paused, blocked) {
            (true, true) => Self::PausedBlocked,
            (true, false) => Self::Paused,
            (false, true) => Self::Blocked,
            (false, false) => Self::Waiting,
        }
    }

    /// State after pausing.
    #[must_use]
    pub fn paused(self) -> Self {
        match self {
            Self::Waiting | Self::Acquired => Self::Paused,
            Self::Blocked => Self::PausedBlocked,
            other => other,
        }
    }

    /// State after the job's execution block is applied.
    #[must_use]
    pub fn blocked(self) -> Self {
        match self {
            Self::Waiting => Self::Blocked,
            Self::Paused => Self::PausedBlocked,
            other => other,
        }
    }

    /// State after the job's execution block is lifted.
    #[must_use]
    pub fn unblocked(self) -> Self {
        match self {
            Self::Blocked => Self::Waiting,
            Self::PausedBlocked => Self::Paused,
            other => other,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Paused => "PAUSED",
            Self::Blocked => "BLOCKED",
            Self::PausedBlocked => "PAUSED_BLOCKED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Trigger state as reported to the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// No such trigger.
    None,
    /// Scheduled normally (waiting, acquired, or executing).
    Normal,
    /// Paused, whether or not also blocked.
    Paused,
    /// Finished.
    Complete,
    /// Failed.
    Error,
    /// Blocked by a running non-concurrent job.
    Blocked,
}

impl From<TriggerState> for TriggerStatus {
    fn from(state: TriggerState) -> Self {
        match state {
            TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing => {
                Self::Normal
            }
            TriggerState::Paused | TriggerState::PausedBlocked => Self::Paused,
            TriggerState::Complete => Self::Complete,
            TriggerState::Blocked => Self::Blocked,
            TriggerState::Error => Self::Error,
        }
    }
}

/// A trigger as stored in the shared trigger map.
///
/// The owner is set exactly when the state is held (acquired or executing);
/// the mutators keep that pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerWrapper {
    /// The trigger definition and its schedule position.
    pub trigger: Trigger,
    state: TriggerState,
    owner: Option<NodeAddress>,
}

impl TriggerWrapper {
    /// Wraps a trigger in an unowned state.
    #[must_use]
    pub fn new(trigger: Trigger, state: TriggerState) -> Self {
        let mut wrapper = Self {
            trigger,
            state: TriggerState::Waiting,
            owner: None,
        };
        wrapper.set_state(state);
        wrapper
    }

    /// The trigger key.
    #[must_use]
    pub fn key(&self) -> &TriggerKey {
        &self.trigger.key
    }

    /// The key of the job the trigger fires.
    #[must_use]
    pub fn job_key(&self) -> &JobKey {
        &self.trigger.job_key
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Owning node, present only while held.
    #[must_use]
    pub fn owner(&self) -> Option<&NodeAddress> {
        self.owner.as_ref()
    }

    /// Returns whether `node` holds this trigger.
    #[must_use]
    pub fn is_held_by(&self, node: &NodeAddress) -> bool {
        self.state.is_held() && self.owner.as_ref() == Some(node)
    }

    /// Moves to an unowned state. Held states must go through `claim`;
    /// passing one here stores it as `Waiting`.
    pub fn set_state(&mut self, state: TriggerState) {
        self.state = if state.is_held() {
            TriggerState::Waiting
        } else {
            state
        };
        self.owner = None;
    }

    /// Moves to a held state owned by `owner`. Unowned states are forwarded
    /// to `set_state`.
    pub fn claim(&mut self, state: TriggerState, owner: NodeAddress) {
        if state.is_held() {
            self.state = state;
            self.owner = Some(owner);
        } else {
            self.set_state(state);
        }
    }
}

/// Orders triggers by firing precedence: earliest next fire time first
/// (triggers that will not fire again last), then higher priority, then key.
#[must_use]
pub fn fire_order(a: &Trigger, b: &Trigger) -> Ordering {
    let by_time = match (a.next_fire_time, b.next_fire_time) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.key.cmp(&b.key))
}
