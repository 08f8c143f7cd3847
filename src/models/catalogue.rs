use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationSource {
    /// A fixed stream with ordered fallbacks.
    Stream {
        url: String,
        #[serde(default)]
        fallbacks: Vec<String>,
    },
    /// Time-derived content. `{hour}` expands to the two-digit local hour,
    /// `{variant}` to an index in `0..variants`.
    Hourly {
        template: String,
        #[serde(default = "default_variants")]
        variants: u32,
    },
}

fn default_variants() -> u32 {
    1
}

/// When a station may be heard, in local wall-clock hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Always,
    /// `start_hour` inclusive, `end_hour` exclusive. Wraps past midnight
    /// when `end_hour < start_hour`; equal bounds mean the whole day.
    Window { start_hour: u32, end_hour: u32 },
}

impl Availability {
    pub fn is_open(&self, hour: u32) -> bool {
        match *self {
            Availability::Always => true,
            Availability::Window { start_hour, end_hour } => {
                let hour = hour % 24;
                if start_hour == end_hour {
                    true
                } else if start_hour < end_hour {
                    hour >= start_hour && hour < end_hour
                } else {
                    hour >= start_hour || hour < end_hour
                }
            }
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, Availability::Window { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub genre: String,
    pub source: StationSource,
    #[serde(default)]
    pub availability: Availability,
}

impl Station {
    pub fn is_hourly(&self) -> bool {
        matches!(self.source, StationSource::Hourly { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicTrack {
    /// Context tag; doubles as the track's identity.
    pub mood: String,
    #[serde(default)]
    pub file: Option<String>,
    /// Melody key used when no file is available.
    #[serde(default)]
    pub chiptune: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    pub stations: Vec<Station>,
    #[serde(default)]
    pub tracks: Vec<MusicTrack>,
    #[serde(default)]
    pub effects: HashMap<String, String>,
    #[serde(default)]
    pub chiptune_dir: Option<PathBuf>,
}

impl Catalogue {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let catalogue: Catalogue = serde_json::from_str(&content)?;
        catalogue.validate()?;
        log::info!(
            "Loaded catalogue: {} stations, {} tracks, {} effects",
            catalogue.stations.len(),
            catalogue.tracks.len(),
            catalogue.effects.len()
        );
        Ok(catalogue)
    }

    /// Rejects duplicate identities; later lookups would silently shadow them.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for station in &self.stations {
            if !seen.insert(station.id.as_str()) {
                return Err(EngineError::InvalidCatalogue(format!("duplicate station id {}", station.id)));
            }
        }
        seen.clear();
        for track in &self.tracks {
            if !seen.insert(track.mood.as_str()) {
                return Err(EngineError::InvalidCatalogue(format!("duplicate track mood {}", track.mood)));
            }
        }
        Ok(())
    }

    pub fn station(&self, id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn track(&self, mood: &str) -> Option<&MusicTrack> {
        self.tracks.iter().find(|t| t.mood == mood)
    }

    pub fn effect(&self, name: &str) -> Option<&str> {
        self.effects.get(name).map(String::as_str)
    }

    /// Highest-priority track among `contexts` that is not cooling down.
    /// Ties go to the context listed first.
    pub fn select_track<F>(&self, contexts: &[&str], cooling: F) -> Option<&MusicTrack>
    where
        F: Fn(&str) -> bool,
    {
        let mut best: Option<&MusicTrack> = None;
        for context in contexts {
            let Some(track) = self.track(context) else {
                continue;
            };
            if cooling(&track.mood) {
                continue;
            }
            match best {
                Some(current) if current.priority >= track.priority => {}
                _ => best = Some(track),
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(mood: &str, priority: i32) -> MusicTrack {
        MusicTrack {
            mood: mood.to_string(),
            file: Some(format!("music/{}.ogg", mood)),
            chiptune: None,
            priority,
        }
    }

    #[test]
    fn test_window_wraps_midnight() {
        let late_show = Availability::Window { start_hour: 22, end_hour: 2 };
        assert!(late_show.is_open(23));
        assert!(late_show.is_open(1));
        assert!(!late_show.is_open(2));
        assert!(!late_show.is_open(12));

        let day = Availability::Window { start_hour: 9, end_hour: 17 };
        assert!(day.is_open(9));
        assert!(!day.is_open(17));
        assert!(Availability::Window { start_hour: 5, end_hour: 5 }.is_open(3));
    }

    #[test]
    fn test_select_track_prefers_priority_and_skips_cooldown() {
        let catalogue = Catalogue {
            tracks: vec![track("explore", 1), track("combat", 5), track("night", 3)],
            ..Catalogue::default()
        };

        let chosen = catalogue.select_track(&["explore", "combat", "night"], |_| false);
        assert_eq!(chosen.map(|t| t.mood.as_str()), Some("combat"));

        let chosen = catalogue.select_track(&["explore", "combat", "night"], |mood| mood == "combat");
        assert_eq!(chosen.map(|t| t.mood.as_str()), Some("night"));

        assert!(catalogue.select_track(&["unknown"], |_| false).is_none());
    }

    #[test]
    fn test_catalogue_json_shape() {
        let json = r#"{
            "chiptune_dir": "sounds/chiptune",
            "stations": [
                {"id": "lofi", "name": "Lofi", "genre": "chill",
                 "source": {"type": "stream", "url": "http://a/primary", "fallbacks": ["http://a/backup"]}},
                {"id": "news", "name": "News",
                 "source": {"type": "hourly", "template": "http://n/{hour}/{variant}.mp3", "variants": 3},
                 "availability": {"type": "window", "start_hour": 6, "end_hour": 10}}
            ],
            "tracks": [{"mood": "explore", "chiptune": "explore", "priority": 2}],
            "effects": {"click": "sfx/click.wav"}
        }"#;

        let catalogue: Catalogue = serde_json::from_str(json).unwrap();
        assert!(catalogue.validate().is_ok());
        assert_eq!(catalogue.station("lofi").unwrap().availability, Availability::Always);
        assert!(catalogue.station("news").unwrap().is_hourly());
        assert_eq!(catalogue.effect("click"), Some("sfx/click.wav"));
        assert!(catalogue.track("explore").unwrap().file.is_none());
    }

    #[test]
    fn test_duplicate_station_rejected() {
        let station = Station {
            id: "dup".to_string(),
            name: "Dup".to_string(),
            tagline: String::new(),
            genre: String::new(),
            source: StationSource::Stream { url: "u".to_string(), fallbacks: vec![] },
            availability: Availability::Always,
        };
        let catalogue = Catalogue {
            stations: vec![station.clone(), station],
            ..Catalogue::default()
        };
        assert!(catalogue.validate().is_err());
    }
}
