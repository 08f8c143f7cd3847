// Per-channel generation counter and the handle it owns.
//
// Every read or write of {generation, handle} happens under the slot's
// mutex, and every externally visible action of a worker goes through
// `GenerationToken::act`, which re-checks the generation under that same
// lock acquisition. Handles removed from the state are stopped after the
// lock is released.

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::services::backend::PlaybackHandle;
use crate::services::crossfade::CrossfadeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Radio,
    Music,
}

/// What a channel has been asked to play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Playing {
    Station(String),
    Track(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Playing,
}

pub struct ChannelState {
    generation: u64,
    pub handle: Option<Box<dyn PlaybackHandle>>,
    pub phase: Phase,
    pub playing: Option<Playing>,
    pub volume: f32,
    /// Music only: mood that may not be selected again before the instant.
    pub cooldown: Option<(String, Instant)>,
    /// Radio only: what to bring back when a scheduled station goes off air.
    pub restore: Option<Playing>,
    pub crossfade: CrossfadeState,
}

impl ChannelState {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cooling(&self, mood: &str, now: Instant) -> bool {
        matches!(&self.cooldown, Some((cooling, until)) if cooling == mood && now < *until)
    }

    /// Clears the channel back to idle, handing back every handle it owned.
    pub fn release_all(&mut self) -> Released {
        let mut handles = Vec::with_capacity(2);
        if let Some(handle) = self.handle.take() {
            handles.push(handle);
        }
        if let Some(outgoing) = self.crossfade.clear() {
            handles.push(outgoing);
        }
        Released(handles)
    }

    pub fn set_idle(&mut self) {
        self.phase = Phase::Idle;
        self.playing = None;
    }
}

/// Handles taken out of a channel. Stopped on drop, which callers let
/// happen after the channel lock is gone.
#[must_use = "dropping stops the released handles"]
pub struct Released(Vec<Box<dyn PlaybackHandle>>);

impl Released {
    pub fn none() -> Self {
        Released(Vec::new())
    }

    pub fn single(handle: Box<dyn PlaybackHandle>) -> Self {
        Released(vec![handle])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Released {
    fn drop(&mut self) {
        for handle in self.0.iter_mut() {
            log::debug!("Stopping {}", handle.locator());
            handle.stop();
        }
    }
}

pub struct ChannelSlot {
    kind: ChannelKind,
    state: Mutex<ChannelState>,
    wake: Condvar,
}

impl ChannelSlot {
    pub fn new(kind: ChannelKind, volume: f32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(ChannelState {
                generation: 0,
                handle: None,
                phase: Phase::Idle,
                playing: None,
                volume,
                cooldown: None,
                restore: None,
                crossfade: CrossfadeState::default(),
            }),
            wake: Condvar::new(),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Invalidates every token issued so far. `next` is what the new
    /// generation is about to play; `None` leaves the channel idle.
    pub fn advance(self: &Arc<Self>, next: Option<Playing>) -> (GenerationToken, Released) {
        let (token, released, ()) = self.advance_with(next, |_| ());
        (token, released)
    }

    /// Like `advance`, running `prepare` on the outgoing state first under
    /// the same lock acquisition.
    pub fn advance_with<R>(
        self: &Arc<Self>,
        next: Option<Playing>,
        prepare: impl FnOnce(&mut ChannelState) -> R,
    ) -> (GenerationToken, Released, R) {
        let result = {
            let mut state = self.state.lock();
            let prepared = prepare(&mut state);
            let token = self.bump(&mut state);
            let released = state.release_all();
            state.phase = if next.is_some() { Phase::Starting } else { Phase::Idle };
            state.playing = next;
            (token, released, prepared)
        };
        self.wake.notify_all();
        result
    }

    /// Advances only while `token` is still current, so a worker handing
    /// the channel over can never override a newer request. `decide`
    /// picks what the new generation plays.
    pub fn supersede(
        self: &Arc<Self>,
        token: &GenerationToken,
        decide: impl FnOnce(&mut ChannelState) -> Option<Playing>,
    ) -> Option<(GenerationToken, Released)> {
        let result = {
            let mut state = self.state.lock();
            if state.generation != token.generation {
                return None;
            }
            let next = decide(&mut state);
            let token = self.bump(&mut state);
            let released = state.release_all();
            state.phase = if next.is_some() { Phase::Starting } else { Phase::Idle };
            state.playing = next;
            (token, released)
        };
        self.wake.notify_all();
        Some(result)
    }

    /// Stops the channel if anything is going on. An idle channel keeps its
    /// generation. Returns what was playing.
    pub fn preempt(self: &Arc<Self>) -> Option<(Option<Playing>, Released)> {
        let result = {
            let mut state = self.state.lock();
            if state.phase == Phase::Idle && state.handle.is_none() {
                return None;
            }
            self.bump(&mut state);
            let released = state.release_all();
            let previous = state.playing.take();
            state.phase = Phase::Idle;
            (previous, released)
        };
        self.wake.notify_all();
        Some(result)
    }

    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.phase != Phase::Idle || state.handle.is_some()
    }

    /// Unconditional access for the arbiter (volume, cooldown lookups).
    /// Workers use `GenerationToken::act` instead.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock()
    }

    /// Caller holds the lock through `state` and must `notify` after
    /// dropping it.
    pub(crate) fn bump(self: &Arc<Self>, state: &mut ChannelState) -> GenerationToken {
        state.generation += 1;
        GenerationToken {
            slot: Arc::clone(self),
            generation: state.generation,
        }
    }

    pub(crate) fn notify(&self) {
        self.wake.notify_all();
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let state = self.state.lock();
        ChannelSnapshot {
            kind: self.kind,
            generation: state.generation,
            phase: state.phase,
            playing: state.playing.clone(),
            locator: state.handle.as_ref().map(|h| h.locator().to_string()),
            volume: state.volume,
            fading: state.crossfade.fading,
        }
    }
}

/// A worker's claim on one generation of one channel.
pub struct GenerationToken {
    slot: Arc<ChannelSlot>,
    generation: u64,
}

impl GenerationToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> ChannelKind {
        self.slot.kind
    }

    pub fn is_current(&self) -> bool {
        self.slot.is_current(self.generation)
    }

    /// Runs `f` only if this generation is still current, under the same
    /// lock acquisition as the check.
    pub fn act<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> Option<R> {
        let mut state = self.slot.state.lock();
        if state.generation != self.generation {
            return None;
        }
        Some(f(&mut state))
    }

    /// Waits up to `timeout`, waking early if the generation moves on.
    /// Returns whether this generation is still current.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while state.generation == self.generation {
            if self.slot.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.generation == self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub kind: ChannelKind,
    pub generation: u64,
    pub phase: Phase,
    pub playing: Option<Playing>,
    pub locator: Option<String>,
    pub volume: f32,
    pub fading: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::HandleStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountedHandle {
        alive: Arc<AtomicUsize>,
        stopped: bool,
    }

    impl CountedHandle {
        fn boxed(alive: &Arc<AtomicUsize>) -> Box<dyn PlaybackHandle> {
            alive.fetch_add(1, Ordering::SeqCst);
            Box::new(CountedHandle { alive: alive.clone(), stopped: false })
        }
    }

    impl PlaybackHandle for CountedHandle {
        fn poll(&mut self) -> HandleStatus {
            HandleStatus::Running
        }
        fn set_volume(&mut self, _volume: f32) -> bool {
            true
        }
        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.alive.fetch_sub(1, Ordering::SeqCst);
            }
        }
        fn locator(&self) -> &str {
            "counted"
        }
    }

    #[test]
    fn test_advance_invalidates_previous_tokens() {
        let slot = ChannelSlot::new(ChannelKind::Radio, 1.0);
        let (first, _) = slot.advance(Some(Playing::Station("a".into())));
        let (second, _) = slot.advance(Some(Playing::Station("b".into())));

        assert!(!first.is_current());
        assert!(second.is_current());
        assert_eq!(slot.generation(), 2);
        assert!(first.act(|_| ()).is_none());
        assert!(second.act(|_| ()).is_some());
    }

    #[test]
    fn test_advance_releases_owned_handle() {
        let alive = Arc::new(AtomicUsize::new(0));
        let slot = ChannelSlot::new(ChannelKind::Music, 1.0);
        let (token, _) = slot.advance(Some(Playing::Track("explore".into())));
        token.act(|state| state.handle = Some(CountedHandle::boxed(&alive))).unwrap();
        assert_eq!(alive.load(Ordering::SeqCst), 1);

        let (_, released) = slot.advance(None);
        assert_eq!(released.len(), 1);
        drop(released);
        assert_eq!(alive.load(Ordering::SeqCst), 0);

        let snapshot = slot.snapshot();
        assert_eq!(snapshot.phase, Phase::Idle);
        assert!(snapshot.playing.is_none());
    }

    #[test]
    fn test_sleep_wakes_on_advance() {
        let slot = ChannelSlot::new(ChannelKind::Radio, 1.0);
        let (token, _) = slot.advance(None);

        let waker = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = waker.advance(None);
        });

        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_times_out_while_current() {
        let slot = ChannelSlot::new(ChannelKind::Radio, 1.0);
        let (token, _) = slot.advance(None);
        assert!(token.sleep(Duration::from_millis(20)));
    }

    #[test]
    fn test_supersede_loses_to_newer_request() {
        let slot = ChannelSlot::new(ChannelKind::Radio, 1.0);
        let (stale, _) = slot.advance(Some(Playing::Station("night".into())));
        let (_newer, _) = slot.advance(Some(Playing::Station("jazz".into())));

        assert!(slot.supersede(&stale, |_| Some(Playing::Station("lofi".into()))).is_none());
        assert_eq!(slot.snapshot().playing, Some(Playing::Station("jazz".into())));
        assert_eq!(slot.generation(), 2);
    }

    #[test]
    fn test_supersede_hands_over_while_current() {
        let alive = Arc::new(AtomicUsize::new(0));
        let slot = ChannelSlot::new(ChannelKind::Radio, 1.0);
        let (token, _) = slot.advance(Some(Playing::Station("night".into())));
        token.act(|state| {
            state.handle = Some(CountedHandle::boxed(&alive));
            state.restore = Some(Playing::Station("lofi".into()));
        });

        let (next, released) = slot.supersede(&token, |state| state.restore.take()).unwrap();
        drop(released);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert!(next.is_current());
        assert!(!token.is_current());

        let snapshot = slot.snapshot();
        assert_eq!(snapshot.phase, Phase::Starting);
        assert_eq!(snapshot.playing, Some(Playing::Station("lofi".into())));
    }

    #[test]
    fn test_preempt_ignores_idle_channel() {
        let alive = Arc::new(AtomicUsize::new(0));
        let slot = ChannelSlot::new(ChannelKind::Music, 1.0);
        assert!(slot.preempt().is_none());
        assert_eq!(slot.generation(), 0);

        let (token, _) = slot.advance(Some(Playing::Track("explore".into())));
        token.act(|state| state.handle = Some(CountedHandle::boxed(&alive)));
        assert!(slot.is_active());

        let (previous, released) = slot.preempt().unwrap();
        drop(released);
        assert_eq!(previous, Some(Playing::Track("explore".into())));
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert!(!slot.is_active());
        assert!(!token.is_current());
    }

    #[test]
    fn test_cooldown_expires() {
        let slot = ChannelSlot::new(ChannelKind::Music, 1.0);
        let now = Instant::now();
        slot.with_state(|state| state.cooldown = Some(("explore".into(), now + Duration::from_secs(30))));
        assert!(slot.with_state(|state| state.is_cooling("explore", now)));
        assert!(!slot.with_state(|state| state.is_cooling("combat", now)));
        assert!(!slot.with_state(|state| state.is_cooling("explore", now + Duration::from_secs(31))));
    }
}
