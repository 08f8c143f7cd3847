use std::env;
use std::path::PathBuf;
use std::time::Duration;
use lazy_static::lazy_static;

lazy_static! {
    // Base directory
    pub static ref BASE_DIR: PathBuf = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    // Station/track/effect catalogue
    pub static ref CATALOGUE_FILE: PathBuf = BASE_DIR.join("catalogue.json");

    // Host settings (volumes, last station)
    pub static ref SETTINGS_FILE: PathBuf = BASE_DIR.join("settings.json");
}

// Worker cadence - stop must be observed within one tick
pub const POLL_INTERVAL_MS: u64 = 100;
pub const STARTUP_GRACE_MS: u64 = 1500;  // Exit inside this window counts as a failed source
pub const DETECT_TIMEOUT_MS: u64 = 2000;  // Per-binary player detection

// Crossfade
pub const CROSSFADE_STEPS: u32 = 20;
pub const CROSSFADE_DURATION_MS: u64 = 3000;
pub const COOLDOWN_MIN_SECS: u64 = 30;
pub const COOLDOWN_MAX_SECS: u64 = 90;

// Effect pool
pub const EFFECT_WORKERS: usize = 4;
pub const EFFECT_QUEUE_CAPACITY: usize = 16;
pub const EFFECT_TIMEOUT_MS: u64 = 5000;

// Event bus
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Runtime knobs of the engine. Defaults come from the constants above,
/// `from_env` lets `AMBIENCE_*` variables override each of them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub startup_grace: Duration,
    pub detect_timeout: Duration,
    pub crossfade_steps: u32,
    pub crossfade_duration: Duration,
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    pub effect_workers: usize,
    pub effect_queue_capacity: usize,
    pub effect_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            startup_grace: Duration::from_millis(STARTUP_GRACE_MS),
            detect_timeout: Duration::from_millis(DETECT_TIMEOUT_MS),
            crossfade_steps: CROSSFADE_STEPS,
            crossfade_duration: Duration::from_millis(CROSSFADE_DURATION_MS),
            cooldown_min: Duration::from_secs(COOLDOWN_MIN_SECS),
            cooldown_max: Duration::from_secs(COOLDOWN_MAX_SECS),
            effect_workers: EFFECT_WORKERS,
            effect_queue_capacity: EFFECT_QUEUE_CAPACITY,
            effect_timeout: Duration::from_millis(EFFECT_TIMEOUT_MS),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            poll_interval: env_millis("AMBIENCE_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            startup_grace: env_millis("AMBIENCE_STARTUP_GRACE_MS").unwrap_or(defaults.startup_grace),
            detect_timeout: env_millis("AMBIENCE_DETECT_TIMEOUT_MS").unwrap_or(defaults.detect_timeout),
            crossfade_steps: env_parse("AMBIENCE_CROSSFADE_STEPS").unwrap_or(defaults.crossfade_steps),
            crossfade_duration: env_millis("AMBIENCE_CROSSFADE_DURATION_MS").unwrap_or(defaults.crossfade_duration),
            cooldown_min: env_parse("AMBIENCE_COOLDOWN_MIN_SECS").map(Duration::from_secs).unwrap_or(defaults.cooldown_min),
            cooldown_max: env_parse("AMBIENCE_COOLDOWN_MAX_SECS").map(Duration::from_secs).unwrap_or(defaults.cooldown_max),
            effect_workers: env_parse("AMBIENCE_EFFECT_WORKERS").unwrap_or(defaults.effect_workers),
            effect_queue_capacity: env_parse("AMBIENCE_EFFECT_QUEUE").unwrap_or(defaults.effect_queue_capacity),
            effect_timeout: env_millis("AMBIENCE_EFFECT_TIMEOUT_MS").unwrap_or(defaults.effect_timeout),
            event_capacity: defaults.event_capacity,
        };

        config.sanitized()
    }

    /// Clamps values that would otherwise stall workers or the pool.
    pub fn sanitized(mut self) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(1);
        }
        // Sub-second responsiveness to stop is a hard bound
        if self.poll_interval > Duration::from_millis(900) {
            self.poll_interval = Duration::from_millis(900);
        }
        self.crossfade_steps = self.crossfade_steps.max(1);
        self.effect_workers = self.effect_workers.max(1);
        self.effect_queue_capacity = self.effect_queue_capacity.max(1);
        self.event_capacity = self.event_capacity.max(1);
        if self.cooldown_max < self.cooldown_min {
            self.cooldown_max = self.cooldown_min;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keep_stop_sub_second() {
        let config = EngineConfig::default();
        assert!(config.poll_interval < Duration::from_secs(1));
        assert!(config.cooldown_min <= config.cooldown_max);
        assert_eq!(config.effect_workers, 4);
    }

    #[test]
    fn test_sanitized_clamps_degenerate_values() {
        let config = EngineConfig {
            poll_interval: Duration::ZERO,
            crossfade_steps: 0,
            effect_workers: 0,
            cooldown_min: Duration::from_secs(10),
            cooldown_max: Duration::from_secs(5),
            ..EngineConfig::default()
        }
        .sanitized();

        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.crossfade_steps, 1);
        assert_eq!(config.effect_workers, 1);
        assert_eq!(config.cooldown_max, Duration::from_secs(10));
    }

    #[test]
    fn test_env_override() {
        env::set_var("AMBIENCE_CROSSFADE_STEPS", "8");
        env::set_var("AMBIENCE_POLL_INTERVAL_MS", "not-a-number");

        let config = EngineConfig::from_env();
        assert_eq!(config.crossfade_steps, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(POLL_INTERVAL_MS));

        env::remove_var("AMBIENCE_CROSSFADE_STEPS");
        env::remove_var("AMBIENCE_POLL_INTERVAL_MS");
    }
}
