// Channel workers: one thread per generation, walking the candidate list.

use std::sync::Arc;
use std::time::Instant;
use log::{debug, info, warn};

use crate::error::EngineError;
use crate::models::{MusicTrack, Station};
use crate::services::arbiter::EngineCore;
use crate::services::backend::{HandleStatus, PlayerBackend, SpawnRequest};
use crate::services::crossfade::{self, FadeOutcome, FadePlan};
use crate::services::generation::{GenerationToken, Phase, Released};
use crate::services::hooks::{call_hook, EngineEvent};

/// Verdict of the per-tick watcher a worker runs while a source plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Watch {
    Continue,
    WindowClosed,
    Reresolve,
}

/// Why a worker left its channel idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Exhausted,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Invalidated,
    /// Would not start, or died inside the startup grace window.
    Failed,
    Ended,
    WindowClosed,
    Reresolve,
}

pub(crate) fn run_radio(core: Arc<EngineCore>, backend: Arc<dyn PlayerBackend>, token: GenerationToken, station: Station) {
    info!("Radio worker {} started for {}", token.generation(), station.name);

    let clock = core.resolver.clock().clone();
    let mut hour = clock.hour();
    let mut watch = || {
        let now = clock.hour();
        if now == hour {
            return Watch::Continue;
        }
        hour = now;
        info!("Hour changed to {:02}:00 on {}", now, station.name);
        call_hook("on_hour_changed", || core.hooks.on_hour_changed(now));
        core.events.emit(EngineEvent::HourChanged { hour: now });

        if !station.availability.is_open(now) {
            Watch::WindowClosed
        } else if station.is_hourly() {
            Watch::Reresolve
        } else {
            Watch::Continue
        }
    };

    let mut played = false;
    'resolve: loop {
        if !station.availability.is_open(clock.hour()) {
            EngineCore::restore_after_window(&core, &token);
            return;
        }

        let candidates = core.resolver.resolve_station(&station);
        for locator in &candidates {
            match play_candidate(&core, backend.as_ref(), &token, locator, false, &mut None, &mut watch) {
                CandidateOutcome::Invalidated => {
                    debug!("Radio worker {} invalidated", token.generation());
                    return;
                }
                CandidateOutcome::Failed => core.resolver.record_failure(&station),
                CandidateOutcome::Ended => played = true,
                CandidateOutcome::WindowClosed => {
                    info!("{} is off the air, restoring previous playback", station.name);
                    EngineCore::restore_after_window(&core, &token);
                    return;
                }
                CandidateOutcome::Reresolve => continue 'resolve,
            }
        }
        break;
    }

    wind_down(&core, &token, if played { Ending::Finished } else { Ending::Exhausted });
}

pub(crate) fn run_music(
    core: Arc<EngineCore>,
    backend: Arc<dyn PlayerBackend>,
    token: GenerationToken,
    track: MusicTrack,
    fade: Option<FadePlan>,
) {
    info!("Music worker {} started for {}", token.generation(), track.mood);

    let mut fade = fade;
    let candidates = core.resolver.resolve_track(&track);
    for locator in &candidates {
        match play_candidate(&core, backend.as_ref(), &token, locator, true, &mut fade, &mut || Watch::Continue) {
            CandidateOutcome::Invalidated => {
                debug!("Music worker {} invalidated", token.generation());
                return;
            }
            CandidateOutcome::Failed => {}
            CandidateOutcome::Ended => {
                // A track that played out rests before it may be picked again
                let cooldown = crossfade::cooldown_between(core.config.cooldown_min, core.config.cooldown_max);
                let noted = token.act(|state| {
                    state.cooldown = Some((track.mood.clone(), Instant::now() + cooldown));
                });
                if noted.is_none() {
                    return;
                }
                info!("{} finished, cooling down for {}s", track.mood, cooldown.as_secs());
                wind_down(&core, &token, Ending::Finished);
                return;
            }
            // Music has no schedule
            CandidateOutcome::WindowClosed | CandidateOutcome::Reresolve => {}
        }
    }

    wind_down(&core, &token, Ending::Exhausted);
}

/// Spawns `locator` if still current and supervises it until it ends,
/// the generation moves on, or the watcher asks for something else.
fn play_candidate(
    core: &EngineCore,
    backend: &dyn PlayerBackend,
    token: &GenerationToken,
    locator: &str,
    looping: bool,
    fade: &mut Option<FadePlan>,
    watch: &mut dyn FnMut() -> Watch,
) -> CandidateOutcome {
    let channel = token.channel();
    let generation = token.generation();
    let fading = fade.is_some();

    if !token.is_current() {
        return CandidateOutcome::Invalidated;
    }
    if let Err(e) = backend.preload(locator) {
        warn!("{:?} generation {}: {}", channel, generation, e);
        core.events.emit(EngineEvent::CandidateFailed { channel, generation, locator: locator.to_string() });
        return CandidateOutcome::Failed;
    }

    let spawned = token.act(|state| {
        let volume = if fading { 0.0 } else { state.volume };
        let handle = backend.spawn(&SpawnRequest { locator, volume, looping })?;
        state.handle = Some(handle);
        state.phase = Phase::Playing;
        Ok::<(), EngineError>(())
    });

    match spawned {
        None => {
            backend.discard(locator);
            return CandidateOutcome::Invalidated;
        }
        Some(Err(e)) => {
            backend.discard(locator);
            warn!("{:?} generation {}: {}", channel, generation, e);
            core.events.emit(EngineEvent::CandidateFailed { channel, generation, locator: locator.to_string() });
            return CandidateOutcome::Failed;
        }
        Some(Ok(())) => {}
    }

    let spawned_at = Instant::now();
    info!("{:?} generation {} playing {}", channel, generation, locator);
    call_hook("on_playback_started", || core.hooks.on_playback_started(channel));
    core.events.emit(EngineEvent::Started { channel, generation, locator: locator.to_string() });

    if let Some(plan) = fade.take() {
        match crossfade::run(token, &plan) {
            FadeOutcome::Invalidated => return CandidateOutcome::Invalidated,
            FadeOutcome::Abandoned => core.events.emit(EngineEvent::CrossfadeAborted),
            FadeOutcome::Completed { from } => {
                core.events.emit(EngineEvent::CrossfadeFinished { from, to: locator.to_string() })
            }
        }
    }

    loop {
        if !token.sleep(core.config.poll_interval) {
            return CandidateOutcome::Invalidated;
        }

        let status = token.act(|state| match state.handle.as_mut() {
            Some(handle) => handle.poll(),
            None => HandleStatus::Finished,
        });

        match status {
            None => return CandidateOutcome::Invalidated,
            Some(HandleStatus::Running) => {}
            Some(status) => {
                let released = token.act(|state| {
                    state.phase = Phase::Starting;
                    state.handle.take().map(Released::single)
                });
                if released.is_none() {
                    return CandidateOutcome::Invalidated;
                }
                drop(released);

                if status == HandleStatus::Failed || spawned_at.elapsed() < core.config.startup_grace {
                    warn!("{:?} generation {}: {} did not stay up", channel, generation, locator);
                    core.events.emit(EngineEvent::CandidateFailed { channel, generation, locator: locator.to_string() });
                    return CandidateOutcome::Failed;
                }
                info!("{:?} generation {}: {} ended", channel, generation, locator);
                return CandidateOutcome::Ended;
            }
        }

        match watch() {
            Watch::Continue => {}
            Watch::WindowClosed => return CandidateOutcome::WindowClosed,
            Watch::Reresolve => {
                let released = token.act(|state| {
                    state.phase = Phase::Starting;
                    state.handle.take().map(Released::single)
                });
                return match released {
                    None => CandidateOutcome::Invalidated,
                    Some(released) => {
                        drop(released);
                        CandidateOutcome::Reresolve
                    }
                };
            }
        }
    }
}

fn wind_down(core: &EngineCore, token: &GenerationToken, ending: Ending) {
    let released = token.act(|state| {
        let released = state.release_all();
        state.set_idle();
        released
    });

    // A newer request owns the channel; nothing to report
    let Some(released) = released else {
        return;
    };
    drop(released);

    let channel = token.channel();
    let generation = token.generation();
    match ending {
        Ending::Exhausted => {
            warn!("{:?}: every source failed, channel idle", channel);
            core.events.emit(EngineEvent::Exhausted { channel, generation });
        }
        Ending::Finished => {
            info!("{:?}: playback finished, channel idle", channel);
            core.events.emit(EngineEvent::Finished { channel, generation });
        }
    }
}
