// Abortable linear volume ramp between an outgoing and an incoming sound.

use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info};
use rand::Rng;

use crate::services::backend::PlaybackHandle;
use crate::services::generation::{ChannelSlot, GenerationToken, Phase, Playing, Released};

/// Lives inside the music channel state, so it shares the channel lock.
#[derive(Default)]
pub struct CrossfadeState {
    pub outgoing: Option<Box<dyn PlaybackHandle>>,
    pub outgoing_from: f32,
    pub outgoing_mood: Option<String>,
    pub incoming_target: f32,
    /// Cleared by stop/abort; the ramp checks it at every step.
    pub fading: bool,
}

impl CrossfadeState {
    /// Ends the fade and hands back the outgoing sound, if any.
    pub fn clear(&mut self) -> Option<Box<dyn PlaybackHandle>> {
        self.fading = false;
        self.outgoing_mood = None;
        self.outgoing.take()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FadePlan {
    pub steps: u32,
    pub duration: Duration,
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
}

impl FadePlan {
    fn step_interval(&self) -> Duration {
        self.duration / self.steps.max(1)
    }

    fn cooldown(&self) -> Duration {
        cooldown_between(self.cooldown_min, self.cooldown_max)
    }
}

/// Random rest in `[min, max]` before a track may be selected again.
pub(crate) fn cooldown_between(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if max_ms <= min_ms {
        return min;
    }
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

pub(crate) enum Begin {
    /// A fade is already in flight on this channel.
    Busy,
    /// Nothing audible to fade from.
    NothingPlaying,
    Started(GenerationToken),
}

/// Moves the current sound into the fading-out slot and opens a new
/// generation for the incoming one, all under one lock acquisition.
pub(crate) fn begin(slot: &Arc<ChannelSlot>, next: Playing, target: f32) -> Begin {
    let token = {
        let mut state = slot.lock();
        if state.crossfade.fading {
            return Begin::Busy;
        }
        let Some(outgoing) = state.handle.take() else {
            return Begin::NothingPlaying;
        };

        let token = slot.bump(&mut state);
        let outgoing_mood = match state.playing.take() {
            Some(Playing::Track(mood)) => Some(mood),
            _ => None,
        };
        state.crossfade = CrossfadeState {
            outgoing: Some(outgoing),
            outgoing_from: state.volume,
            outgoing_mood,
            incoming_target: target,
            fading: true,
        };
        state.playing = Some(next);
        state.phase = Phase::Starting;
        token
    };
    slot.notify();
    Begin::Started(token)
}

/// Stops the outgoing sound now and leaves the incoming one wherever its
/// ramp had got to.
pub(crate) fn abort(slot: &ChannelSlot) -> Released {
    let released = slot.with_state(|state| {
        if !state.crossfade.fading {
            return Released::none();
        }
        match state.crossfade.clear() {
            Some(outgoing) => Released::single(outgoing),
            None => Released::none(),
        }
    });
    slot.notify();
    released
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FadeOutcome {
    Completed { from: Option<String> },
    /// Flag cleared while this generation stayed current.
    Abandoned,
    Invalidated,
}

/// Runs the ramp for the incoming handle already installed under `token`.
pub(crate) fn run(token: &GenerationToken, plan: &FadePlan) -> FadeOutcome {
    let steps = plan.steps.max(1);
    let interval = plan.step_interval();

    for step in 1..=steps {
        if !token.sleep(interval) {
            return FadeOutcome::Invalidated;
        }

        let t = step as f32 / steps as f32;
        let still_fading = token.act(|state| {
            if !state.crossfade.fading {
                return false;
            }
            let from = state.crossfade.outgoing_from;
            let target = state.crossfade.incoming_target;
            if let Some(outgoing) = state.crossfade.outgoing.as_mut() {
                outgoing.set_volume(from * (1.0 - t));
            }
            if let Some(incoming) = state.handle.as_mut() {
                incoming.set_volume(target * t);
            }
            true
        });

        match still_fading {
            None => return FadeOutcome::Invalidated,
            Some(false) => {
                debug!("Crossfade abandoned at step {}/{}", step, steps);
                return FadeOutcome::Abandoned;
            }
            Some(true) => {}
        }
    }

    let cooldown = plan.cooldown();
    let finished = token.act(|state| {
        if !state.crossfade.fading {
            return None;
        }
        let from = state.crossfade.outgoing_mood.clone();
        if let Some(mood) = &from {
            state.cooldown = Some((mood.clone(), Instant::now() + cooldown));
        }
        let outgoing = state.crossfade.clear();
        Some((from, outgoing.map(Released::single)))
    });

    match finished {
        None => FadeOutcome::Invalidated,
        Some(None) => FadeOutcome::Abandoned,
        Some(Some((from, released))) => {
            drop(released);
            info!("Crossfade complete, {:?} cooling down for {}s", from, cooldown.as_secs());
            FadeOutcome::Completed { from }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::HandleStatus;
    use crate::services::generation::ChannelKind;
    use parking_lot::Mutex;

    struct VolumeSpy {
        volume: Arc<Mutex<f32>>,
        stopped: Arc<Mutex<bool>>,
    }

    impl PlaybackHandle for VolumeSpy {
        fn poll(&mut self) -> HandleStatus {
            HandleStatus::Running
        }
        fn set_volume(&mut self, volume: f32) -> bool {
            *self.volume.lock() = volume;
            true
        }
        fn stop(&mut self) {
            *self.stopped.lock() = true;
        }
        fn locator(&self) -> &str {
            "spy"
        }
    }

    fn spy() -> (Box<dyn PlaybackHandle>, Arc<Mutex<f32>>, Arc<Mutex<bool>>) {
        let volume = Arc::new(Mutex::new(1.0));
        let stopped = Arc::new(Mutex::new(false));
        let handle = Box::new(VolumeSpy { volume: volume.clone(), stopped: stopped.clone() });
        (handle, volume, stopped)
    }

    fn plan() -> FadePlan {
        FadePlan {
            steps: 4,
            duration: Duration::from_millis(40),
            cooldown_min: Duration::from_secs(30),
            cooldown_max: Duration::from_secs(60),
        }
    }

    fn playing_slot() -> (Arc<ChannelSlot>, Arc<Mutex<bool>>) {
        let slot = ChannelSlot::new(ChannelKind::Music, 0.8);
        let (token, _) = slot.advance(Some(Playing::Track("explore".into())));
        let (outgoing, _, stopped) = spy();
        token.act(|state| state.handle = Some(outgoing)).unwrap();
        (slot, stopped)
    }

    #[test]
    fn test_cooldown_stays_in_band() {
        let min = Duration::from_secs(30);
        let max = Duration::from_secs(90);
        for _ in 0..50 {
            let cooldown = cooldown_between(min, max);
            assert!(cooldown >= min && cooldown <= max);
        }
        assert_eq!(cooldown_between(max, min), max);
    }

    #[test]
    fn test_second_begin_is_noop() {
        let (slot, _) = playing_slot();
        let Begin::Started(token) = begin(&slot, Playing::Track("night".into()), 0.8) else {
            panic!("first crossfade should start");
        };
        assert!(matches!(begin(&slot, Playing::Track("combat".into()), 0.8), Begin::Busy));
        assert!(token.is_current());
    }

    #[test]
    fn test_begin_needs_something_audible() {
        let slot = ChannelSlot::new(ChannelKind::Music, 0.8);
        assert!(matches!(begin(&slot, Playing::Track("night".into()), 0.8), Begin::NothingPlaying));
    }

    #[test]
    fn test_completed_fade_stops_outgoing_and_sets_cooldown() {
        let (slot, outgoing_stopped) = playing_slot();
        let Begin::Started(token) = begin(&slot, Playing::Track("night".into()), 0.8) else {
            panic!("crossfade should start");
        };
        let (incoming, incoming_volume, _) = spy();
        token.act(|state| state.handle = Some(incoming)).unwrap();

        let outcome = run(&token, &plan());
        assert_eq!(outcome, FadeOutcome::Completed { from: Some("explore".into()) });
        assert!(*outgoing_stopped.lock());
        assert!((*incoming_volume.lock() - 0.8).abs() < 1e-6);
        assert!(slot.with_state(|state| state.is_cooling("explore", Instant::now())));
        assert!(!slot.snapshot().fading);
    }

    #[test]
    fn test_abort_leaves_incoming_alive() {
        let (slot, outgoing_stopped) = playing_slot();
        let Begin::Started(token) = begin(&slot, Playing::Track("night".into()), 0.8) else {
            panic!("crossfade should start");
        };
        let (incoming, _, incoming_stopped) = spy();
        token.act(|state| state.handle = Some(incoming)).unwrap();

        drop(abort(&slot));
        assert!(*outgoing_stopped.lock());

        assert_eq!(run(&token, &plan()), FadeOutcome::Abandoned);
        assert!(!*incoming_stopped.lock());
        assert!(token.is_current());
    }

    #[test]
    fn test_stop_mid_fade_releases_both() {
        let (slot, outgoing_stopped) = playing_slot();
        let Begin::Started(token) = begin(&slot, Playing::Track("night".into()), 0.8) else {
            panic!("crossfade should start");
        };
        let (incoming, _, incoming_stopped) = spy();
        token.act(|state| state.handle = Some(incoming)).unwrap();

        let (_, released) = slot.advance(None);
        assert_eq!(released.len(), 2);
        drop(released);
        assert!(*outgoing_stopped.lock());
        assert!(*incoming_stopped.lock());
        assert_eq!(run(&token, &plan()), FadeOutcome::Invalidated);
    }
}
