use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The timer state machine. Pausing is a stop followed by a later start, so
/// there is no third state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running {
        entry_id: Uuid,
        task_id: Uuid,
        started_at: DateTime<Utc>,
    },
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn entry_id(&self) -> Option<Uuid> {
        match self {
            Self::Running { entry_id, .. } => Some(*entry_id),
            Self::Idle => None,
        }
    }
}

/// Published after a session transition has been committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        entry_id: Uuid,
        task_id: Uuid,
        at: DateTime<Utc>,
    },
    Stopped {
        entry_id: Uuid,
        task_id: Uuid,
        started_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// A running entry left behind by an unclean shutdown was picked up again.
    Restored {
        entry_id: Uuid,
        task_id: Uuid,
        started_at: DateTime<Utc>,
    },
    /// The running entry's start was edited.
    Adjusted {
        entry_id: Uuid,
        started_at: DateTime<Utc>,
    },
}
