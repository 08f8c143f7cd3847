// Host callbacks and the engine's event bus.

use std::panic::{self, AssertUnwindSafe};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::services::generation::{ChannelKind, Playing};

/// Notifications the host may act on. Both are best-effort: a panicking
/// hook is caught and logged, playback carries on.
pub trait HostHooks: Send + Sync {
    /// A channel just got sound out of a source (e.g. mute unrelated music).
    fn on_playback_started(&self, _channel: ChannelKind) {}

    /// The local wall-clock hour rolled over while radio was playing.
    fn on_hour_changed(&self, _hour: u32) {}
}

pub struct NoHooks;

impl HostHooks for NoHooks {}

pub(crate) fn call_hook<F: FnOnce()>(name: &str, hook: F) {
    if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!("Host hook {} panicked; ignoring", name);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started { channel: ChannelKind, generation: u64, locator: String },
    CandidateFailed { channel: ChannelKind, generation: u64, locator: String },
    /// Every candidate failed to start or died inside the grace window.
    Exhausted { channel: ChannelKind, generation: u64 },
    /// The source played out on its own and the channel went idle.
    Finished { channel: ChannelKind, generation: u64 },
    Stopped { channel: ChannelKind, generation: u64 },
    Restored { target: Option<Playing> },
    CrossfadeFinished { from: Option<String>, to: String },
    CrossfadeAborted,
    HourChanged { hour: u32 },
}

/// Fan-out of engine events. Sending never blocks; with no subscribers
/// events are simply dropped.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
