//! Marker model and the local marker set

use crate::error::{Result, SyncError};
use crate::identity::ClientId;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A (latitude, longitude) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

impl From<(f64, f64)> for Position {
    fn from((lat, lng): (f64, f64)) -> Self {
        Self { lat, lng }
    }
}

/// `#RRGGBB` color string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color(String);

impl Color {
    pub fn new(color: impl Into<String>) -> Result<Self> {
        let color = color.into();
        let valid = color.len() == 7
            && color.starts_with('#')
            && color[1..].chars().all(|c| c.is_ascii_hexdigit());

        if !valid {
            return Err(SyncError::InvalidColor(color));
        }
        Ok(Self(color))
    }

    /// One uniform draw over all 24-bit colors
    pub fn random() -> Self {
        let rgb: u32 = rand::thread_rng().gen_range(0..=0xFF_FFFF);
        Self(format!("#{:06X}", rgb))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point annotation; `id` names the publishing client, not the marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: ClientId,
    pub position: Position,
    pub color: Color,
}

impl Marker {
    pub fn new(id: ClientId, position: Position, color: Color) -> Self {
        Self { id, position, color }
    }
}

/// Markers in arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    /// Remove every marker, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.markers.len();
        self.markers.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    pub fn as_slice(&self) -> &[Marker] {
        &self.markers
    }

    pub fn to_vec(&self) -> Vec<Marker> {
        self.markers.clone()
    }
}
