use std::path::PathBuf;

use derive_more::Display;
use thiserror::Error;

use crate::play::limit::Limit;

pub mod process;
pub mod session;
pub mod uci;

/// Whether the engine process is torn down and re-spawned between the games
/// of a round, or kept running for the whole tournament.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub enum RestartMode {
    #[default]
    Off,
    On,
}

/// Immutable description of one tournament participant.
/// `name` is unique within a tournament, which the CLI layer enforces.
#[derive(Debug, Clone)]
#[must_use]
pub struct EngineConfig {
    pub name: String,
    pub cmd: String,
    pub dir: Option<PathBuf>,
    pub args: Vec<String>,
    /// Text sent to the engine before the `uci` handshake.
    pub init_string: Option<String>,
    /// Redirect the child's stderr to this file instead of the log.
    pub stderr_file: Option<PathBuf>,
    pub limit: Limit,
    pub restart: RestartMode,
    /// Applied in order after the handshake. Duplicate names are a config error.
    pub options: Vec<(String, String)>,
}

impl EngineConfig {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            name: name.to_string(),
            cmd: cmd.to_string(),
            dir: None,
            args: vec![],
            init_string: None,
            stderr_file: None,
            limit: Limit::default(),
            restart: RestartMode::Off,
            options: vec![],
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum StreamKind {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
}

/// Transport and protocol failures the callers have to branch on.
/// Everything in here is attributable to one engine; the game driver turns
/// these into terminal game reasons instead of aborting the tournament.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("spawning the engine process failed: {0}")]
    SpawnFailed(String),
    #[error("the engine did not respond before the deadline")]
    Timeout,
    #[error("interrupted while waiting for the engine")]
    Interrupted,
    #[error("the engine closed its {0} stream, it probably crashed")]
    Disconnected(StreamKind),
    #[error("the engine process is no longer running")]
    NotAlive,
    #[error("the engine broke the protocol: {0}")]
    Protocol(String),
    #[error("I/O error while talking to the engine: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for failures where the engine is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            EngineError::Disconnected(_) | EngineError::NotAlive | EngineError::Io(_)
        )
    }
}
