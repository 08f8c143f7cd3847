// Fixed pool of workers for one-shot sound effects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::services::backend::{HandleStatus, PlayerBackend, SpawnRequest};

// Effects are short; poll them a little faster than channels
const EFFECT_POLL_MS: u64 = 25;

struct EffectJob {
    locator: String,
    volume: f32,
}

pub struct EffectDispatcher {
    sender: Mutex<Option<Sender<EffectJob>>>,
    in_flight: Arc<AtomicUsize>,
    workers: usize,
}

impl EffectDispatcher {
    /// Starts `workers` threads. Without a backend nothing is started and
    /// every `fire` is refused.
    pub fn new(backend: Option<Arc<dyn PlayerBackend>>, workers: usize, capacity: usize, timeout: Duration) -> Self {
        let in_flight = Arc::new(AtomicUsize::new(0));

        let Some(backend) = backend else {
            return Self {
                sender: Mutex::new(None),
                in_flight,
                workers: 0,
            };
        };

        let (tx, rx) = channel::bounded::<EffectJob>(capacity.max(1));
        let mut started = 0;
        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let backend = backend.clone();
            let in_flight = in_flight.clone();
            let spawned = thread::Builder::new()
                .name(format!("ambience-fx-{}", index))
                .spawn(move || effect_worker(rx, backend, in_flight, timeout));
            match spawned {
                Ok(_) => started += 1,
                Err(e) => error!("Failed to start effect worker {}: {}", index, e),
            }
        }

        Self {
            sender: Mutex::new(if started > 0 { Some(tx) } else { None }),
            in_flight,
            workers: started,
        }
    }

    /// Never blocks. Returns whether the effect was queued.
    pub fn fire(&self, locator: &str, volume: f32) -> bool {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return false;
        };

        let job = EffectJob {
            locator: locator.to_string(),
            volume,
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                debug!("Effect queue full, dropping {}", job.locator);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Effects currently sounding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Refuses new effects; workers exit once the queue drains.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

fn effect_worker(rx: Receiver<EffectJob>, backend: Arc<dyn PlayerBackend>, in_flight: Arc<AtomicUsize>, timeout: Duration) {
    for job in rx.iter() {
        let request = SpawnRequest {
            locator: &job.locator,
            volume: job.volume,
            looping: false,
        };
        let mut handle = match backend.spawn(&request) {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Effect {} failed to start: {}", job.locator, e);
                continue;
            }
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while handle.poll() == HandleStatus::Running {
            if Instant::now() >= deadline {
                warn!("Effect {} overran {}ms, abandoning", job.locator, timeout.as_millis());
                break;
            }
            thread::sleep(Duration::from_millis(EFFECT_POLL_MS));
        }
        handle.stop();
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Effect worker exiting");
}
