pub mod catalogue;
pub mod settings;

pub use catalogue::{Availability, Catalogue, MusicTrack, Station, StationSource};
pub use settings::Settings;
