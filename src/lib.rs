// Library exports for the ambience crate
// The demo binary and integration tests go through this public API

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{best_effort, BestEffort, EngineError, Result};
pub use models::{Availability, Catalogue, MusicTrack, Settings, Station, StationSource};
pub use services::arbiter::{AudioEngine, EngineBuilder, EngineStatus, VolumeTarget};
pub use services::backend::{HandleStatus, PlaybackHandle, PlayerBackend, PlayerKind, SpawnRequest};
pub use services::generation::{ChannelKind, ChannelSnapshot, Phase, Playing};
pub use services::hooks::{EngineEvent, HostHooks, NoHooks};
pub use services::mixer::{Mixer, MixerSound};
pub use utils::{Clock, ManualClock, SystemClock};
