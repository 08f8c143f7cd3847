// Turns stations and tracks into ordered candidate locators.

use std::path::PathBuf;
use std::sync::Arc;
use dashmap::DashMap;
use log::debug;

use crate::models::{MusicTrack, Station, StationSource};
use crate::utils::Clock;

const CHIPTUNE_EXTENSION: &str = "ogg";

pub struct SourceResolver {
    clock: Arc<dyn Clock>,
    chiptune_dir: Option<PathBuf>,
    // Per-station variant offset for hourly content
    rotation: DashMap<String, u32>,
}

impl SourceResolver {
    pub fn new(clock: Arc<dyn Clock>, chiptune_dir: Option<PathBuf>) -> Self {
        Self {
            clock,
            chiptune_dir,
            rotation: DashMap::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn resolve_station(&self, station: &Station) -> Vec<String> {
        match &station.source {
            StationSource::Stream { url, fallbacks } => {
                let mut candidates = Vec::with_capacity(1 + fallbacks.len());
                candidates.push(url.clone());
                candidates.extend(fallbacks.iter().cloned());
                candidates
            }
            StationSource::Hourly { template, variants } => {
                let variants = (*variants).max(1);
                let hour = self.clock.hour();
                let offset = self.rotation.get(&station.id).map(|v| *v).unwrap_or(0);

                (0..variants)
                    .map(|i| hourly_locator(template, hour, (offset + i) % variants))
                    .collect()
            }
        }
    }

    /// The file first, then the chiptune rendition of the melody key.
    pub fn resolve_track(&self, track: &MusicTrack) -> Vec<String> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(file) = &track.file {
            candidates.push(file.clone());
        }
        if let Some(key) = &track.chiptune {
            let file_name = format!("{}.{}", key, CHIPTUNE_EXTENSION);
            let path = match &self.chiptune_dir {
                Some(dir) => dir.join(file_name),
                None => PathBuf::from(file_name),
            };
            candidates.push(path.to_string_lossy().into_owned());
        }
        candidates
    }

    /// Rotates hourly stations to their next variant. No-op for streams.
    pub fn record_failure(&self, station: &Station) {
        if let StationSource::Hourly { variants, .. } = &station.source {
            let variants = (*variants).max(1);
            let mut offset = self.rotation.entry(station.id.clone()).or_insert(0);
            *offset = (*offset + 1) % variants;
            debug!("Rotated {} to variant {}", station.id, *offset);
        }
    }
}

pub fn hourly_locator(template: &str, hour: u32, variant: u32) -> String {
    template
        .replace("{hour}", &format!("{:02}", hour % 24))
        .replace("{variant}", &variant.to_string())
}
