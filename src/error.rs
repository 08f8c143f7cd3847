use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Result of an operation whose failure is deliberately non-fatal.
/// Consumed by `best_effort`, never handed back to the host.
pub type BestEffort = Result<()>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid catalogue: {0}")]
    InvalidCatalogue(String),

    #[error("Unknown station: {0}")]
    UnknownStation(String),

    #[error("Unknown music track: {0}")]
    UnknownTrack(String),

    #[error("Unknown sound effect: {0}")]
    UnknownEffect(String),

    #[error("Failed to start player for {locator}: {source}")]
    Spawn {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mixer error: {0}")]
    Mixer(String),
}

/// Logs and discards a failure that must not reach the caller.
pub fn best_effort(what: &str, result: BestEffort) {
    if let Err(e) = result {
        log::debug!("{} failed (ignored): {}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_names_locator() {
        let err = EngineError::Spawn {
            locator: "http://example.invalid/stream".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "mpv"),
        };
        assert!(err.to_string().contains("http://example.invalid/stream"));
    }

    #[test]
    fn test_best_effort_swallows_errors() {
        best_effort("test", Err(EngineError::Mixer("device gone".into())));
        best_effort("test", Ok(()));
    }
}
