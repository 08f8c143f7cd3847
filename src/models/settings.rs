use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Host-owned preferences. The engine reads them, it never persists them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_station: Option<String>,
    #[serde(default = "default_volume")]
    pub radio_volume: f32,
    #[serde(default = "default_volume")]
    pub music_volume: f32,
    #[serde(default = "default_volume")]
    pub effects_volume: f32,
}

fn default_enabled() -> bool {
    true
}

fn default_volume() -> f32 {
    0.7
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            last_station: None,
            radio_volume: default_volume(),
            music_volume: default_volume(),
            effects_volume: default_volume(),
        }
    }
}

impl Settings {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Failed to read settings {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings.clamped())
    }

    pub fn clamped(mut self) -> Self {
        self.radio_volume = clamp_volume(self.radio_volume);
        self.music_volume = clamp_volume(self.music_volume);
        self.effects_volume = clamp_volume(self.effects_volume);
        self
    }
}

pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}
