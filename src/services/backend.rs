// Player backends: external player processes and player detection.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::services::mixer::{Mixer, MixerBackend};

// Time a player gets to honour SIGTERM before it is killed outright
const TERM_GRACE_MS: u64 = 30;
const ANSWER_POLL_MS: u64 = 20;

/// What a handle reported the last time it was polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Running,
    /// Ended on its own with a clean exit.
    Finished,
    /// Ended with an error, or could not be queried.
    Failed,
}

/// A live sound owned by exactly one generation of one channel,
/// or by one effect job.
pub trait PlaybackHandle: Send {
    fn poll(&mut self) -> HandleStatus;

    /// Applies a logical volume in `0.0..=1.0`. Returns `false` when the
    /// backend cannot change volume on a playing sound.
    fn set_volume(&mut self, volume: f32) -> bool;

    /// Best-effort and idempotent.
    fn stop(&mut self);

    fn locator(&self) -> &str;
}

/// Parameters of one spawn.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub locator: &'a str,
    pub volume: f32,
    pub looping: bool,
}

pub trait PlayerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Must be cheap: channel workers call it under the channel lock.
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Box<dyn PlaybackHandle>>;

    /// Slow groundwork for a coming `spawn` of `locator` (reading and
    /// decoding a file). Runs before the channel lock is taken.
    fn preload(&self, _locator: &str) -> Result<()> {
        Ok(())
    }

    /// Forgets groundwork from `preload` that no spawn will use.
    fn discard(&self, _locator: &str) {}

    /// Whether `set_volume` works on playing handles; crossfades need it.
    fn supports_live_volume(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    Mpv,
    Ffplay,
    Mplayer,
    Paplay,
}

impl PlayerKind {
    /// Detection order.
    pub const ALL: [PlayerKind; 4] = [PlayerKind::Mpv, PlayerKind::Ffplay, PlayerKind::Mplayer, PlayerKind::Paplay];

    pub fn program(&self) -> &'static str {
        match self {
            PlayerKind::Mpv => "mpv",
            PlayerKind::Ffplay => "ffplay",
            PlayerKind::Mplayer => "mplayer",
            PlayerKind::Paplay => "paplay",
        }
    }

    fn version_args(&self) -> &'static [&'static str] {
        match self {
            PlayerKind::Mpv => &["--version"],
            PlayerKind::Ffplay => &["-version"],
            PlayerKind::Mplayer => &["-really-quiet", "-v"],
            PlayerKind::Paplay => &["--version"],
        }
    }

    /// Maps logical volume to the player's native argument.
    /// paplay speaks PulseAudio's 0..65536 scale, the rest 0..100.
    pub fn native_volume(&self, volume: f32) -> u32 {
        let volume = crate::models::settings::clamp_volume(volume);
        match self {
            PlayerKind::Paplay => (volume * 65536.0).round() as u32,
            _ => (volume * 100.0).round() as u32,
        }
    }

    pub fn supports_looping(&self) -> bool {
        !matches!(self, PlayerKind::Paplay)
    }

    pub fn command_args(&self, locator: &str, volume: f32, looping: bool) -> Vec<String> {
        let native = self.native_volume(volume).to_string();
        let mut args: Vec<String> = match self {
            PlayerKind::Mpv => vec![
                "--no-video".into(),
                "--really-quiet".into(),
                format!("--volume={}", native),
            ],
            PlayerKind::Ffplay => vec![
                "-nodisp".into(),
                "-autoexit".into(),
                "-loglevel".into(),
                "quiet".into(),
                "-volume".into(),
                native,
            ],
            PlayerKind::Mplayer => vec![
                "-really-quiet".into(),
                "-novideo".into(),
                "-nolirc".into(),
                "-volume".into(),
                native,
            ],
            PlayerKind::Paplay => vec![format!("--volume={}", native)],
        };

        if looping {
            match self {
                PlayerKind::Mpv => args.push("--loop=inf".into()),
                PlayerKind::Ffplay | PlayerKind::Mplayer => {
                    args.push("-loop".into());
                    args.push("0".into());
                }
                PlayerKind::Paplay => {}
            }
        }

        args.push(locator.to_string());
        args
    }
}

/// Spawns one external player process per sound.
pub struct ProcessBackend {
    kind: PlayerKind,
}

impl ProcessBackend {
    pub fn new(kind: PlayerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> PlayerKind {
        self.kind
    }
}

impl PlayerBackend for ProcessBackend {
    fn name(&self) -> &str {
        self.kind.program()
    }

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Box<dyn PlaybackHandle>> {
        let looping = request.looping && self.kind.supports_looping();
        let args = self.kind.command_args(request.locator, request.volume, looping);

        let child = Command::new(self.kind.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                locator: request.locator.to_string(),
                source,
            })?;

        debug!("Spawned {} (pid {}) for {}", self.kind.program(), child.id(), request.locator);

        Ok(Box::new(ProcessHandle {
            child,
            locator: request.locator.to_string(),
            stopped: false,
        }))
    }
}

pub struct ProcessHandle {
    child: Child,
    locator: String,
    stopped: bool,
}

impl PlaybackHandle for ProcessHandle {
    fn poll(&mut self) -> HandleStatus {
        if self.stopped {
            return HandleStatus::Finished;
        }
        match self.child.try_wait() {
            Ok(None) => HandleStatus::Running,
            Ok(Some(status)) if status.success() => HandleStatus::Finished,
            Ok(Some(_)) => HandleStatus::Failed,
            Err(e) => {
                warn!("Lost track of player for {}: {}", self.locator, e);
                HandleStatus::Failed
            }
        }
    }

    fn set_volume(&mut self, _volume: f32) -> bool {
        // Volume is fixed at spawn time for external players
        false
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        terminate(&self.child);
        let deadline = Instant::now() + Duration::from_millis(TERM_GRACE_MS);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if let Err(e) = self.child.kill() {
            debug!("Kill of player for {} failed: {}", self.locator, e);
        }
        // Reap so the process does not linger as a zombie
        let _ = self.child.wait();
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn terminate(child: &Child) {
    // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn terminate(_child: &Child) {}

/// Looks for player binaries once and remembers the answer.
pub struct Detector {
    candidates: Vec<PlayerKind>,
    timeout: Duration,
    cached: OnceLock<Option<PlayerKind>>,
}

impl Detector {
    pub fn new(candidates: Vec<PlayerKind>, timeout: Duration) -> Self {
        Self {
            candidates,
            timeout,
            cached: OnceLock::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn detect(&self) -> Option<PlayerKind> {
        *self.cached.get_or_init(|| {
            let found = self
                .candidates
                .iter()
                .copied()
                .find(|kind| program_answers(kind.program(), kind.version_args(), self.timeout));

            match found {
                Some(kind) => info!("Using {} for playback", kind.program()),
                None => warn!("No audio player found; playback disabled"),
            }
            found
        })
    }
}

static SYSTEM_DETECTOR: OnceLock<Detector> = OnceLock::new();

/// Host player for the lifetime of the process. The first caller's
/// `detect_timeout` is the one every binary is checked with.
pub fn detect_player(detect_timeout: Duration) -> Option<PlayerKind> {
    system_detector(detect_timeout).detect()
}

fn system_detector(detect_timeout: Duration) -> &'static Detector {
    SYSTEM_DETECTOR.get_or_init(|| Detector::new(PlayerKind::ALL.to_vec(), detect_timeout))
}

/// A supplied mixer wins over any player binary.
pub fn detect(mixer: Option<Arc<dyn Mixer>>, detect_timeout: Duration) -> Option<Arc<dyn PlayerBackend>> {
    if let Some(mixer) = mixer {
        info!("Using in-process mixer for playback");
        return Some(Arc::new(MixerBackend::new(mixer)));
    }
    detect_player(detect_timeout).map(|kind| Arc::new(ProcessBackend::new(kind)) as Arc<dyn PlayerBackend>)
}

/// True when `program` starts and exits within `timeout`.
pub fn program_answers(program: &str, args: &[&str], timeout: Duration) -> bool {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(_) => return false,
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(ANSWER_POLL_MS)),
            _ => {
                debug!("{} did not answer in time", program);
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
        }
    }
}
