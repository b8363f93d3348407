//! Error taxonomy for the tracking engine.
//!
//! Every fallible engine call returns [`TrackerError`]. Only
//! [`TrackerError::Corruption`] blocks startup; everything else is surfaced
//! to the caller, which decides whether to retry, override or abort.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Input has the wrong shape (empty name, end before start).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced project, task or entry does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// The write would break a store invariant. Retry with an override or abort.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// More than one running entry was found at startup.
    #[error("Store is corrupt: {} entries are open at once ({})", open_entries.len(), join_ids(open_entries))]
    Corruption { open_entries: Vec<Uuid> },

    /// A multi-page read saw the store change between pages. Nothing from
    /// the partial read should be used; start the query over.
    #[error("Store changed during a read (revision {started} -> {current}); restart the query")]
    StaleRead { started: u64, current: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to apply migration {version}: {source}")]
    Migration {
        version: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A blocking worker panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Background(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Errors the front end can recover from without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Corruption { .. } | Self::Migration { .. })
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_message_lists_every_open_entry() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let msg = TrackerError::Corruption {
            open_entries: vec![a, b],
        }
        .to_string();

        assert!(msg.contains("2 entries"));
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }

    #[test]
    fn only_corruption_and_migration_are_fatal() {
        assert!(TrackerError::Conflict("overlap".into()).is_recoverable());
        assert!(TrackerError::InvalidState("idle".into()).is_recoverable());
        assert!(TrackerError::StaleRead { started: 1, current: 2 }.is_recoverable());
        assert!(!TrackerError::Corruption {
            open_entries: vec![]
        }
        .is_recoverable());
    }
}
