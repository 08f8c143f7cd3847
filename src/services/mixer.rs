// In-process mixer contract and its adapter onto PlayerBackend.

use std::sync::Arc;
use dashmap::DashMap;

use crate::error::Result;
use crate::services::backend::{HandleStatus, PlaybackHandle, PlayerBackend, SpawnRequest};

pub trait Mixer: Send + Sync {
    fn load(&self, locator: &str) -> Result<Arc<dyn MixerSound>>;
}

pub trait MixerSound: Send + Sync {
    /// Plays `loops + 1` times; a negative count repeats forever.
    fn play(&self, loops: i32) -> Result<()>;
    fn is_busy(&self) -> bool;
    fn set_volume(&self, volume: f32);
    fn stop(&self);
}

pub struct MixerBackend {
    mixer: Arc<dyn Mixer>,
    // Sounds loaded ahead of their spawn, keyed by locator
    preloaded: DashMap<String, Arc<dyn MixerSound>>,
}

impl MixerBackend {
    pub fn new(mixer: Arc<dyn Mixer>) -> Self {
        Self {
            mixer,
            preloaded: DashMap::new(),
        }
    }

    pub fn preloaded(&self) -> usize {
        self.preloaded.len()
    }
}

impl PlayerBackend for MixerBackend {
    fn name(&self) -> &str {
        "mixer"
    }

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Box<dyn PlaybackHandle>> {
        let sound = match self.preloaded.remove(request.locator) {
            Some((_, sound)) => sound,
            None => self.mixer.load(request.locator)?,
        };
        sound.set_volume(request.volume);
        sound.play(if request.looping { -1 } else { 0 })?;

        Ok(Box::new(MixerHandle {
            sound,
            locator: request.locator.to_string(),
            stopped: false,
        }))
    }

    fn preload(&self, locator: &str) -> Result<()> {
        let sound = self.mixer.load(locator)?;
        self.preloaded.insert(locator.to_string(), sound);
        Ok(())
    }

    fn discard(&self, locator: &str) {
        self.preloaded.remove(locator);
    }

    fn supports_live_volume(&self) -> bool {
        true
    }
}

struct MixerHandle {
    sound: Arc<dyn MixerSound>,
    locator: String,
    stopped: bool,
}

impl PlaybackHandle for MixerHandle {
    fn poll(&mut self) -> HandleStatus {
        if !self.stopped && self.sound.is_busy() {
            HandleStatus::Running
        } else {
            HandleStatus::Finished
        }
    }

    fn set_volume(&mut self, volume: f32) -> bool {
        if !self.stopped {
            self.sound.set_volume(volume);
        }
        true
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.sound.stop();
        }
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}

impl Drop for MixerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "rodio-mixer")]
pub mod rodio_mixer {
    //! Mixer on top of rodio. Local files only; stream locators fail to
    //! load and the supervisor moves on to the next candidate.

    use std::io::Cursor;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use parking_lot::Mutex;
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};

    use super::{Mixer, MixerSound};
    use crate::error::{EngineError, Result};

    pub struct RodioMixer {
        handle: OutputStreamHandle,
    }

    impl RodioMixer {
        /// Opens the default output device. The stream itself is not `Send`,
        /// so it lives on a parked thread for the rest of the process.
        pub fn open() -> Result<Self> {
            let (tx, rx) = mpsc::channel();
            thread::Builder::new()
                .name("ambience-output".into())
                .spawn(move || match OutputStream::try_default() {
                    Ok((stream, handle)) => {
                        let _ = tx.send(Ok(handle));
                        let _stream = stream;
                        loop {
                            thread::park();
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                    }
                })?;

            let handle = rx
                .recv()
                .map_err(|e| EngineError::Mixer(e.to_string()))?
                .map_err(EngineError::Mixer)?;
            Ok(Self { handle })
        }
    }

    impl Mixer for RodioMixer {
        fn load(&self, locator: &str) -> Result<Arc<dyn MixerSound>> {
            let data = std::fs::read(locator)?;
            // Fail early on undecodable data instead of at play time
            Decoder::new(Cursor::new(data.clone())).map_err(|e| EngineError::Mixer(e.to_string()))?;

            Ok(Arc::new(RodioSound {
                handle: self.handle.clone(),
                data,
                sink: Mutex::new(None),
                volume: Mutex::new(1.0),
            }))
        }
    }

    struct RodioSound {
        handle: OutputStreamHandle,
        data: Vec<u8>,
        sink: Mutex<Option<Sink>>,
        volume: Mutex<f32>,
    }

    impl RodioSound {
        fn decoder(&self) -> Result<Decoder<Cursor<Vec<u8>>>> {
            Decoder::new(Cursor::new(self.data.clone())).map_err(|e| EngineError::Mixer(e.to_string()))
        }
    }

    impl MixerSound for RodioSound {
        fn play(&self, loops: i32) -> Result<()> {
            let sink = Sink::try_new(&self.handle).map_err(|e| EngineError::Mixer(e.to_string()))?;
            sink.set_volume(*self.volume.lock());

            if loops < 0 {
                sink.append(self.decoder()?.repeat_infinite());
            } else {
                for _ in 0..=loops {
                    sink.append(self.decoder()?);
                }
            }

            if let Some(previous) = self.sink.lock().replace(sink) {
                previous.stop();
            }
            Ok(())
        }

        fn is_busy(&self) -> bool {
            self.sink.lock().as_ref().map(|sink| !sink.empty()).unwrap_or(false)
        }

        fn set_volume(&self, volume: f32) {
            *self.volume.lock() = volume;
            if let Some(sink) = self.sink.lock().as_ref() {
                sink.set_volume(volume);
            }
        }

        fn stop(&self) {
            if let Some(sink) = self.sink.lock().take() {
                sink.stop();
            }
        }
    }
}
