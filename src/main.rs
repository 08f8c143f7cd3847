// src/main.rs - Interactive demo driving the engine from stdin

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use ambience::config;
use ambience::{AudioEngine, Catalogue, ChannelKind, EngineConfig, HostHooks, Settings, VolumeTarget};

struct ConsoleHooks;

impl HostHooks for ConsoleHooks {
    fn on_playback_started(&self, channel: ChannelKind) {
        println!("  ♪ {:?} started", channel);
    }

    fn on_hour_changed(&self, hour: u32) {
        println!("  ⏰ It is now {:02}:00", hour);
    }
}

fn main() {
    // Initialize logging
    env_logger::init();

    println!("============================================================");
    println!("Ambience - radio, music and effects engine demo");
    println!("============================================================");

    let mut args = env::args().skip(1);
    let catalogue_path = args.next().map(PathBuf::from).unwrap_or_else(|| config::CATALOGUE_FILE.clone());
    let settings_path = args.next().map(PathBuf::from).unwrap_or_else(|| config::SETTINGS_FILE.clone());

    let catalogue = match Catalogue::load(&catalogue_path) {
        Ok(catalogue) => catalogue,
        Err(e) => {
            eprintln!("Failed to load catalogue {}: {}", catalogue_path.display(), e);
            process::exit(1);
        }
    };
    let settings = Settings::load_or_default(&settings_path);

    println!(
        "✅ {} stations, {} tracks, {} effects",
        catalogue.stations.len(),
        catalogue.tracks.len(),
        catalogue.effects.len()
    );

    let builder = AudioEngine::builder(catalogue)
        .config(EngineConfig::from_env())
        .hooks(Arc::new(ConsoleHooks))
        .settings(settings.clone());

    #[cfg(feature = "rodio-mixer")]
    let builder = match ambience::services::mixer::rodio_mixer::RodioMixer::open() {
        Ok(mixer) => builder.mixer(Arc::new(mixer)),
        Err(e) => {
            eprintln!("Audio device unavailable ({}), falling back to player binaries", e);
            builder
        }
    };

    let engine = builder.build();
    match engine.backend_name() {
        Some(name) => println!("🔊 Playing through {}", name),
        None => println!("⚠️  No audio player found; commands will be accepted but silent"),
    }

    match engine.resume_last_station(&settings) {
        Ok(true) => println!("   Resumed {}", settings.last_station.as_deref().unwrap_or_default()),
        Ok(false) => {}
        Err(e) => println!("   Could not resume last station: {}", e),
    }

    println!("Commands: radio <id> | music <mood...> | fade <mood> | fx <name> | volume <radio|music|fx> <0-1> | on | off | stop | status | quit");

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Failed to read command: {}", e);
                break;
            }
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, rest)) = words.split_first() else {
            continue;
        };

        match command {
            "radio" => match rest.first() {
                Some(id) => report(engine.play_station(id)),
                None => println!("usage: radio <id>"),
            },
            "music" => {
                if rest.is_empty() {
                    println!("usage: music <mood...>");
                } else if !engine.update_music(rest) {
                    println!("  (no change)");
                }
            }
            "fade" => match rest.first() {
                Some(mood) => report(engine.crossfade(mood, EngineConfig::from_env().crossfade_duration)),
                None => println!("usage: fade <mood>"),
            },
            "fx" => match rest.first() {
                Some(name) => report(engine.fire_effect(name)),
                None => println!("usage: fx <name>"),
            },
            "volume" => set_volume(&engine, rest),
            "on" => engine.set_enabled(true),
            "off" => engine.set_enabled(false),
            "stop" => engine.stop(),
            "status" => match serde_json::to_string_pretty(&engine.status()) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to render status: {}", e),
            },
            "quit" | "exit" => break,
            other => println!("Unknown command: {}", other),
        }
    }

    println!("Shutting down...");
    engine.shutdown();
}

fn report(result: ambience::Result<bool>) {
    match result {
        Ok(true) => {}
        Ok(false) => println!("  (ignored)"),
        Err(e) => println!("  error: {}", e),
    }
}

fn set_volume(engine: &AudioEngine, rest: &[&str]) {
    let target = match rest.first().copied() {
        Some("radio") => VolumeTarget::Radio,
        Some("music") => VolumeTarget::Music,
        Some("fx") => VolumeTarget::Effects,
        _ => {
            println!("usage: volume <radio|music|fx> <0-1>");
            return;
        }
    };
    match rest.get(1).and_then(|v| v.parse::<f32>().ok()) {
        Some(volume) => engine.set_volume(target, volume),
        None => println!("usage: volume <radio|music|fx> <0-1>"),
    }
}
