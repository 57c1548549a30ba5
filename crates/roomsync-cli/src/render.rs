//! Terminal rendering of the marker set

use colored::*;
use roomsync_core::{Marker, StateObserver, SyncState, SyncWarning};

/// Prints engine notifications as they happen
pub struct TerminalView {
    /// Suppress the per-change summary lines
    pub quiet: bool,
}

impl StateObserver for TerminalView {
    fn markers_changed(&self, markers: &[Marker]) {
        if !self.quiet {
            println!("{} {}", "~".blue(), summary(markers).blue());
        }
    }

    fn state_changed(&self, state: SyncState) {
        let line = format!("[{}]", state);
        match state {
            SyncState::Streaming => println!("{}", line.green()),
            SyncState::Subscribing => println!("{}", line.yellow()),
            SyncState::Disconnected | SyncState::Closed => println!("{}", line.red()),
        }
    }

    fn warning(&self, warning: &SyncWarning) {
        eprintln!("{} {}", "Warning:".yellow().bold(), warning);
    }
}

pub fn summary(markers: &[Marker]) -> String {
    match markers.len() {
        0 => "map is empty".to_string(),
        1 => "1 marker on the map".to_string(),
        n => format!("{} markers on the map", n),
    }
}

/// One line per marker
pub fn marker_line(index: usize, marker: &Marker, own: bool) -> String {
    format!(
        "{:>3}) {:>10.5} {:>11.5}  {}  {}{}",
        index + 1,
        marker.position.lat,
        marker.position.lng,
        marker.color,
        marker.id,
        if own { " (you)" } else { "" }
    )
}
