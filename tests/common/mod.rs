//! Shared helpers for the room scenarios

#![allow(dead_code)]

use parking_lot::Mutex;
use roomsync_core::{BackoffConfig, EngineConfig, Marker, Position, StateObserver, SyncState, SyncWarning};
use std::time::Duration;

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        backoff: BackoffConfig {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_attempts: None,
        },
        ..Default::default()
    }
}

/// Wait up to five seconds for `condition`
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn positions(markers: &[Marker]) -> Vec<(f64, f64)> {
    markers.iter().map(|m| (m.position.lat, m.position.lng)).collect()
}

pub fn at(lat: f64, lng: f64) -> Position {
    Position::new(lat, lng)
}

/// Records every notification
#[derive(Default)]
pub struct Recorder {
    pub snapshots: Mutex<Vec<Vec<Marker>>>,
    pub states: Mutex<Vec<SyncState>>,
    pub warnings: Mutex<Vec<SyncWarning>>,
}

impl Recorder {
    /// Whether any snapshot ever contained a marker at `position`
    pub fn ever_saw(&self, position: Position) -> bool {
        self.snapshots
            .lock()
            .iter()
            .any(|snapshot| snapshot.iter().any(|m| m.position == position))
    }
}

impl StateObserver for Recorder {
    fn markers_changed(&self, markers: &[Marker]) {
        self.snapshots.lock().push(markers.to_vec());
    }

    fn state_changed(&self, state: SyncState) {
        self.states.lock().push(state);
    }

    fn warning(&self, warning: &SyncWarning) {
        self.warnings.lock().push(warning.clone());
    }
}
