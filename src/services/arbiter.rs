// Single entry point the host talks to. Owns both channels, the effect
// pool and the event bus, and enforces the priority rules between them:
// radio always wins, music yields while radio is active, effects are
// independent of both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::{best_effort, EngineError, Result};
use crate::models::settings::clamp_volume;
use crate::models::{Catalogue, MusicTrack, Settings, Station};
use crate::services::backend::{self, PlayerBackend};
use crate::services::crossfade::{self, Begin, FadePlan};
use crate::services::effects::EffectDispatcher;
use crate::services::generation::{ChannelKind, ChannelSlot, ChannelSnapshot, GenerationToken, Playing, Released};
use crate::services::hooks::{EngineEvent, EventBus, HostHooks, NoHooks};
use crate::services::mixer::Mixer;
use crate::services::resolver::SourceResolver;
use crate::services::supervisor;
use crate::utils::{Clock, SystemClock};

/// Which volume `set_volume` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeTarget {
    Radio,
    Music,
    Effects,
}

impl From<ChannelKind> for VolumeTarget {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Radio => VolumeTarget::Radio,
            ChannelKind::Music => VolumeTarget::Music,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub backend: Option<String>,
    pub radio: ChannelSnapshot,
    pub music: ChannelSnapshot,
    /// What radio will hand back to when its scheduled station goes off air.
    pub restore: Option<Playing>,
    pub effects_volume: f32,
    pub effects_in_flight: usize,
}

/// Worker a handover decided on, started once `arbitration` is released.
enum Launch {
    Radio(GenerationToken, Station),
    Music(GenerationToken, MusicTrack, Option<FadePlan>),
}

/// State shared between the engine handle and its workers.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) catalogue: Arc<Catalogue>,
    pub(crate) backend: Option<Arc<dyn PlayerBackend>>,
    pub(crate) resolver: SourceResolver,
    pub(crate) radio: Arc<ChannelSlot>,
    pub(crate) music: Arc<ChannelSlot>,
    pub(crate) hooks: Arc<dyn HostHooks>,
    pub(crate) events: EventBus,
    effects: EffectDispatcher,
    effects_volume: Mutex<f32>,
    enabled: AtomicBool,
    /// Serialises every decision that reads one channel and moves the other.
    /// Taken before any slot lock, never while holding one.
    arbitration: Mutex<()>,
}

impl EngineCore {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn fade_plan(&self, duration: Duration) -> FadePlan {
        FadePlan {
            steps: self.config.crossfade_steps,
            duration,
            cooldown_min: self.config.cooldown_min,
            cooldown_max: self.config.cooldown_max,
        }
    }

    /// Called by a radio worker whose scheduled station went off air.
    /// Opens a new generation for whatever was active before the station
    /// started, unless a newer request already owns the radio channel.
    pub(crate) fn restore_after_window(core: &Arc<Self>, token: &GenerationToken) {
        let hour = core.resolver.clock().hour();
        let mut target = None;

        let guard = core.arbitration.lock();
        let superseded = core.radio.supersede(token, |state| {
            target = state.restore.take();
            match &target {
                Some(Playing::Station(id)) => match core.catalogue.station(id) {
                    Some(station) if station.availability.is_open(hour) => Some(Playing::Station(id.clone())),
                    _ => None,
                },
                _ => None,
            }
        });

        let Some((radio_token, released)) = superseded else {
            debug!("Radio generation {} already replaced, nothing to restore", token.generation());
            return;
        };
        let mut released = vec![released];

        info!("Restoring {:?} after scheduled station ended", target);
        core.events.emit(EngineEvent::Restored { target: target.clone() });

        let launch = match target {
            Some(Playing::Station(id)) => match core.catalogue.station(&id) {
                Some(station) if station.availability.is_open(hour) => Some(Launch::Radio(radio_token, station.clone())),
                _ => {
                    info!("{} is off the air as well, radio idle", id);
                    None
                }
            },
            Some(Playing::Track(mood)) => {
                drop(radio_token);
                let mut next = None;
                best_effort(
                    "restore music",
                    Self::track_handover(core, &mood, &mut released).map(|launch| next = launch),
                );
                next
            }
            None => {
                debug!("Nothing to restore, radio idle");
                None
            }
        };

        drop(guard);
        drop(released);
        Self::launch(core, launch);
    }

    fn start_station(core: &Arc<Self>, id: &str) -> Result<bool> {
        let station = core
            .catalogue
            .station(id)
            .ok_or_else(|| EngineError::UnknownStation(id.to_string()))?
            .clone();

        let guard = core.arbitration.lock();
        let mut released = Vec::new();
        let launch = Self::station_handover(core, station, &mut released);
        drop(guard);
        drop(released);
        Ok(Self::launch(core, launch))
    }

    /// Caller holds `arbitration`.
    fn station_handover(core: &Arc<Self>, station: Station, released: &mut Vec<Released>) -> Option<Launch> {
        if !core.is_enabled() || core.backend.is_none() {
            debug!("Ignoring radio request for {}", station.id);
            return None;
        }

        let hour = core.resolver.clock().hour();
        if !station.availability.is_open(hour) {
            info!("{} is not on the air at {:02}:00", station.name, hour);
            return None;
        }

        // Radio wins: music goes before the radio worker exists
        let music_before = match core.music.preempt() {
            Some((previous, stopped)) => {
                released.push(stopped);
                core.events.emit(EngineEvent::Stopped { channel: ChannelKind::Music, generation: core.music.generation() });
                previous
            }
            None => None,
        };

        let (token, stopped, ()) = core.radio.advance_with(Some(Playing::Station(station.id.clone())), |state| {
            let previous = match state.playing.take() {
                Some(Playing::Station(current)) if current == station.id => state.restore.take(),
                Some(Playing::Station(current)) => {
                    let scheduled = core.catalogue.station(&current).map_or(false, |s| s.availability.is_scheduled());
                    if scheduled {
                        state.restore.take()
                    } else {
                        Some(Playing::Station(current))
                    }
                }
                _ => music_before,
            };
            state.restore = previous;
        });
        released.push(stopped);

        info!("Radio generation {}: {}", token.generation(), station.name);
        Some(Launch::Radio(token, station))
    }

    fn start_track(core: &Arc<Self>, mood: &str) -> Result<bool> {
        let guard = core.arbitration.lock();
        let mut released = Vec::new();
        let launch = Self::track_handover(core, mood, &mut released);
        drop(guard);
        drop(released);
        Ok(Self::launch(core, launch?))
    }

    /// Caller holds `arbitration`.
    fn track_handover(core: &Arc<Self>, mood: &str, released: &mut Vec<Released>) -> Result<Option<Launch>> {
        let track = core
            .catalogue
            .track(mood)
            .ok_or_else(|| EngineError::UnknownTrack(mood.to_string()))?
            .clone();

        if !core.is_enabled() || core.backend.is_none() {
            debug!("Ignoring music request for {}", mood);
            return Ok(None);
        }
        if core.radio.is_active() {
            debug!("Radio is active, music request for {} ignored", mood);
            return Ok(None);
        }

        let (token, stopped) = core.music.advance(Some(Playing::Track(track.mood.clone())));
        released.push(stopped);

        info!("Music generation {}: {}", token.generation(), track.mood);
        Ok(Some(Launch::Music(token, track, None)))
    }

    fn start_crossfade(core: &Arc<Self>, track: MusicTrack, duration: Duration) -> bool {
        let guard = core.arbitration.lock();
        let mut released = Vec::new();
        let launch = Self::crossfade_handover(core, track, duration, &mut released);
        drop(guard);
        drop(released);
        Self::launch(core, launch)
    }

    /// Caller holds `arbitration`.
    fn crossfade_handover(
        core: &Arc<Self>,
        track: MusicTrack,
        duration: Duration,
        released: &mut Vec<Released>,
    ) -> Option<Launch> {
        if !core.is_enabled() || core.backend.is_none() || core.radio.is_active() {
            return None;
        }

        let live_volume = core.backend.as_ref().map_or(false, |b| b.supports_live_volume());
        if !live_volume {
            debug!("Backend cannot fade, switching to {} directly", track.mood);
            return Self::track_handover(core, &track.mood, released).ok().flatten();
        }

        let target = core.music.with_state(|state| state.volume);
        match crossfade::begin(&core.music, Playing::Track(track.mood.clone()), target) {
            Begin::Busy => {
                debug!("Crossfade already running, {} ignored", track.mood);
                None
            }
            Begin::NothingPlaying => Self::track_handover(core, &track.mood, released).ok().flatten(),
            Begin::Started(token) => {
                info!("Music generation {}: crossfading to {}", token.generation(), track.mood);
                let plan = core.fade_plan(duration);
                Some(Launch::Music(token, track, Some(plan)))
            }
        }
    }

    /// Starts the worker a handover decided on. Returns whether there was one.
    fn launch(core: &Arc<Self>, launch: Option<Launch>) -> bool {
        match launch {
            Some(Launch::Radio(token, station)) => Self::launch_radio(core, token, station),
            Some(Launch::Music(token, track, fade)) => Self::launch_music(core, token, track, fade),
            None => return false,
        }
        true
    }

    fn launch_radio(core: &Arc<Self>, token: GenerationToken, station: Station) {
        let Some(backend) = core.backend.clone() else {
            return;
        };
        let generation = token.generation();
        let worker_core = core.clone();
        let spawned = thread::Builder::new()
            .name("ambience-radio".to_string())
            .spawn(move || supervisor::run_radio(worker_core, backend, token, station));
        if let Err(e) = spawned {
            error!("Failed to start radio worker: {}", e);
            Self::abandon(&core.radio, generation);
        }
    }

    fn launch_music(core: &Arc<Self>, token: GenerationToken, track: MusicTrack, fade: Option<FadePlan>) {
        let Some(backend) = core.backend.clone() else {
            return;
        };
        let generation = token.generation();
        let worker_core = core.clone();
        let spawned = thread::Builder::new()
            .name("ambience-music".to_string())
            .spawn(move || supervisor::run_music(worker_core, backend, token, track, fade));
        if let Err(e) = spawned {
            error!("Failed to start music worker: {}", e);
            Self::abandon(&core.music, generation);
        }
    }

    /// No worker will ever serve `generation`; idle the channel if it is still current.
    fn abandon(slot: &ChannelSlot, generation: u64) {
        let released = slot.with_state(|state| {
            if state.generation() != generation {
                return None;
            }
            let released = state.release_all();
            state.set_idle();
            Some(released)
        });
        drop(released);
    }

    fn stop_channel(&self, slot: &Arc<ChannelSlot>) {
        let guard = self.arbitration.lock();
        let released = self.halt(slot);
        drop(guard);
        drop(released);
    }

    /// Caller holds `arbitration`.
    fn halt(&self, slot: &Arc<ChannelSlot>) -> Released {
        let (token, released, ()) = slot.advance_with(None, |state| {
            state.restore = None;
        });
        self.events.emit(EngineEvent::Stopped { channel: slot.kind(), generation: token.generation() });
        released
    }
}

/// Configures and constructs an `AudioEngine`.
pub struct EngineBuilder {
    catalogue: Catalogue,
    config: EngineConfig,
    backend: Option<Option<Arc<dyn PlayerBackend>>>,
    mixer: Option<Arc<dyn Mixer>>,
    clock: Arc<dyn Clock>,
    hooks: Arc<dyn HostHooks>,
    settings: Settings,
}

impl EngineBuilder {
    pub fn new(catalogue: Catalogue) -> Self {
        Self {
            catalogue,
            config: EngineConfig::default(),
            backend: None,
            mixer: None,
            clock: Arc::new(SystemClock),
            hooks: Arc::new(NoHooks),
            settings: Settings::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Skips host detection and plays through `backend`.
    pub fn backend(mut self, backend: Arc<dyn PlayerBackend>) -> Self {
        self.backend = Some(Some(backend));
        self
    }

    /// Builds an inert engine, as on a host with no usable player.
    pub fn no_backend(mut self) -> Self {
        self.backend = Some(None);
        self
    }

    /// Prefer an in-process mixer over player binaries during detection.
    pub fn mixer(mut self, mixer: Arc<dyn Mixer>) -> Self {
        self.mixer = Some(mixer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn HostHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> AudioEngine {
        let config = self.config.sanitized();
        let settings = self.settings.clamped();

        let backend = match self.backend {
            Some(chosen) => chosen,
            None => backend::detect(self.mixer, config.detect_timeout),
        };
        match &backend {
            Some(backend) => info!("Playback backend: {}", backend.name()),
            None => warn!("No playback backend available, audio disabled"),
        }

        let resolver = SourceResolver::new(self.clock, self.catalogue.chiptune_dir.clone());
        let effects = EffectDispatcher::new(
            backend.clone(),
            config.effect_workers,
            config.effect_queue_capacity,
            config.effect_timeout,
        );

        let core = EngineCore {
            events: EventBus::new(config.event_capacity),
            catalogue: Arc::new(self.catalogue),
            backend,
            resolver,
            radio: ChannelSlot::new(ChannelKind::Radio, settings.radio_volume),
            music: ChannelSlot::new(ChannelKind::Music, settings.music_volume),
            hooks: self.hooks,
            effects,
            effects_volume: Mutex::new(settings.effects_volume),
            enabled: AtomicBool::new(settings.enabled),
            arbitration: Mutex::new(()),
            config,
        };

        AudioEngine { core: Arc::new(core) }
    }
}

/// Dropping the engine stops everything it started.
pub struct AudioEngine {
    core: Arc<EngineCore>,
}

impl AudioEngine {
    pub fn builder(catalogue: Catalogue) -> EngineBuilder {
        EngineBuilder::new(catalogue)
    }

    /// Engine on the detected host player with default tuning.
    pub fn new(catalogue: Catalogue) -> Self {
        EngineBuilder::new(catalogue).build()
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.core.catalogue
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.core.backend.as_ref().map(|backend| backend.name())
    }

    /// Starts a station, stopping any music first. `Ok(false)` when the
    /// engine is disabled, has no backend, or the station is off the air.
    pub fn play_station(&self, id: &str) -> Result<bool> {
        EngineCore::start_station(&self.core, id)
    }

    pub fn stop_radio(&self) {
        info!("Stopping radio");
        self.core.stop_channel(&self.core.radio);
    }

    /// Switches music to `mood` straight away. Ignored while radio plays.
    pub fn play_track(&self, mood: &str) -> Result<bool> {
        EngineCore::start_track(&self.core, mood)
    }

    /// Picks the best track for the active game contexts and moves to it,
    /// fading when the backend can. Returns whether anything changed.
    pub fn update_music(&self, contexts: &[&str]) -> bool {
        let core = &self.core;
        if !core.is_enabled() || core.backend.is_none() || core.radio.is_active() {
            return false;
        }

        let now = Instant::now();
        let selected = core
            .catalogue
            .select_track(contexts, |mood| core.music.with_state(|state| state.is_cooling(mood, now)))
            .cloned();
        let Some(track) = selected else {
            debug!("No track for contexts {:?}", contexts);
            return false;
        };

        let current = core.music.snapshot();
        if current.playing == Some(Playing::Track(track.mood.clone())) {
            return false;
        }

        EngineCore::start_crossfade(core, track, core.config.crossfade_duration)
    }

    /// Fades from the current track to `mood`. A second request while a
    /// fade is running is ignored.
    pub fn crossfade(&self, mood: &str, duration: Duration) -> Result<bool> {
        let track = self
            .core
            .catalogue
            .track(mood)
            .ok_or_else(|| EngineError::UnknownTrack(mood.to_string()))?
            .clone();

        Ok(EngineCore::start_crossfade(&self.core, track, duration))
    }

    /// Cuts the outgoing sound of a running fade. The incoming one keeps
    /// playing at whatever volume it reached.
    pub fn abort_crossfade(&self) -> bool {
        let released = crossfade::abort(&self.core.music);
        let aborted = !released.is_empty();
        drop(released);
        if aborted {
            info!("Crossfade aborted");
            self.core.events.emit(EngineEvent::CrossfadeAborted);
        }
        aborted
    }

    pub fn stop_music(&self) {
        info!("Stopping music");
        self.core.stop_channel(&self.core.music);
    }

    pub fn stop(&self) {
        self.stop_radio();
        self.stop_music();
    }

    /// Plays a named effect from the catalogue.
    pub fn fire_effect(&self, name: &str) -> Result<bool> {
        let locator = self
            .core
            .catalogue
            .effect(name)
            .ok_or_else(|| EngineError::UnknownEffect(name.to_string()))?
            .to_string();
        Ok(self.fire_locator(&locator))
    }

    /// Plays any file as an effect. Never blocks; a full queue drops it.
    pub fn fire_locator(&self, locator: &str) -> bool {
        if !self.core.is_enabled() {
            return false;
        }
        let volume = *self.core.effects_volume.lock();
        self.core.effects.fire(locator, volume)
    }

    pub fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    /// Disabling stops both channels at once; while disabled every play
    /// request and effect is ignored.
    pub fn set_enabled(&self, enabled: bool) {
        let core = &self.core;
        let guard = core.arbitration.lock();
        let was = core.enabled.swap(enabled, Ordering::SeqCst);
        if was == enabled {
            return;
        }
        info!("Audio {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            return;
        }

        // Nothing may start between the flag flip and both channels idling
        let released = [core.halt(&core.radio), core.halt(&core.music)];
        drop(guard);
        drop(released);
    }

    /// Sets the target volume and applies it to live handles that allow it.
    pub fn set_volume(&self, target: VolumeTarget, volume: f32) {
        let volume = clamp_volume(volume);
        let slot = match target {
            VolumeTarget::Radio => &self.core.radio,
            VolumeTarget::Music => &self.core.music,
            VolumeTarget::Effects => {
                *self.core.effects_volume.lock() = volume;
                return;
            }
        };

        slot.with_state(|state| {
            state.volume = volume;
            if state.crossfade.fading {
                // The ramp picks the new target up on its next step
                state.crossfade.incoming_target = volume;
                return;
            }
            if let Some(handle) = state.handle.as_mut() {
                if !handle.set_volume(volume) {
                    debug!("{} takes the new volume on next start", handle.locator());
                }
            }
        });
    }

    pub fn volume(&self, target: VolumeTarget) -> f32 {
        match target {
            VolumeTarget::Radio => self.core.radio.with_state(|state| state.volume),
            VolumeTarget::Music => self.core.music.with_state(|state| state.volume),
            VolumeTarget::Effects => *self.core.effects_volume.lock(),
        }
    }

    /// Applies host preferences. Does not start playback.
    pub fn apply_settings(&self, settings: &Settings) {
        let settings = settings.clone().clamped();
        self.set_volume(VolumeTarget::Radio, settings.radio_volume);
        self.set_volume(VolumeTarget::Music, settings.music_volume);
        self.set_volume(VolumeTarget::Effects, settings.effects_volume);
        self.set_enabled(settings.enabled);
    }

    /// Plays the station the host last had on, if any.
    pub fn resume_last_station(&self, settings: &Settings) -> Result<bool> {
        match settings.last_station.as_deref() {
            Some(id) => self.play_station(id),
            None => Ok(false),
        }
    }

    pub fn generation(&self, channel: ChannelKind) -> u64 {
        match channel {
            ChannelKind::Radio => self.core.radio.generation(),
            ChannelKind::Music => self.core.music.generation(),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            enabled: self.core.is_enabled(),
            backend: self.backend_name().map(str::to_string),
            radio: self.core.radio.snapshot(),
            music: self.core.music.snapshot(),
            restore: self.core.radio.with_state(|state| state.restore.clone()),
            effects_volume: *self.core.effects_volume.lock(),
            effects_in_flight: self.core.effects.in_flight(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    /// Stops both channels and refuses further effects.
    pub fn shutdown(&self) {
        self.stop();
        self.core.effects.shutdown();
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
