//! Change notifications for whatever renders the marker set

use crate::engine::SyncState;
use crate::marker::Marker;

/// Conditions the front end should tell the user about
#[derive(Debug, Clone, PartialEq)]
pub enum SyncWarning {
    /// A local mutation is visible locally but did not reach the log
    Unpublished { kind: &'static str, error: String },
    /// Re-subscribing gave up; the session is local-only until restarted
    ConnectionLost { error: String, attempts: u32 },
}

impl std::fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncWarning::Unpublished { kind, error } => {
                write!(f, "{} shown locally but not shared: {}", kind, error)
            }
            SyncWarning::ConnectionLost { error, attempts } => {
                write!(f, "connection lost after {} attempts: {}", attempts, error)
            }
        }
    }
}

/// Receives engine notifications
///
/// Callbacks run on the thread that caused the change, one at a time. They
/// may read from the engine but must not mutate it.
pub trait StateObserver: Send + Sync {
    /// The full marker set after a change, in arrival order
    fn markers_changed(&self, markers: &[Marker]);

    fn state_changed(&self, _state: SyncState) {}

    fn warning(&self, _warning: &SyncWarning) {}
}
