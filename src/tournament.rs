use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shakmaty::CastlingMode;
use strum_macros::{Display, EnumString};

use crate::engine::EngineConfig;
use crate::play::adjudication::AdjudicationSettings;
use crate::play::openings::OpeningOptions;
use crate::tournament::stats::SprtOptions;

pub mod affinity;
pub mod pairing;
pub mod scheduler;
pub mod stats;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, EnumString, Display)]
pub enum Variant {
    #[default]
    #[strum(serialize = "standard")]
    Standard,
    #[strum(serialize = "fischerandom")]
    FischerRandom,
}

impl Variant {
    pub fn castling_mode(self) -> CastlingMode {
        match self {
            Variant::Standard => CastlingMode::Standard,
            Variant::FischerRandom => CastlingMode::Chess960,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, EnumString, Display)]
pub enum TournamentFormat {
    #[default]
    #[strum(serialize = "roundrobin")]
    RoundRobin,
    #[strum(serialize = "gauntlet")]
    Gauntlet,
}

/// What the PGN writer annotates on each move, per the `-pgnout` keys.
#[derive(Debug, Clone)]
#[must_use]
pub struct PgnOptions {
    pub file: PathBuf,
    /// Minimal tag roster only.
    pub min: bool,
    pub track_nodes: bool,
    pub track_seldepth: bool,
    pub track_nps: bool,
    pub track_hashfull: bool,
    pub track_tbhits: bool,
    pub track_pv: bool,
}

impl PgnOptions {
    pub fn new(file: PathBuf) -> Self {
        PgnOptions {
            file,
            min: false,
            track_nodes: false,
            track_seldepth: false,
            track_nps: false,
            track_hashfull: false,
            track_tbhits: false,
            track_pv: false,
        }
    }
}

#[derive(Debug, Clone)]
#[must_use]
pub struct EpdOptions {
    pub file: PathBuf,
}

/// The fully parsed and validated description of one tournament run.
#[derive(Debug, Clone)]
#[must_use]
pub struct TournamentOptions {
    pub engines: Vec<Arc<EngineConfig>>,
    pub format: TournamentFormat,
    pub variant: Variant,
    /// Encounters per pair; each encounter plays `games_per_round` games.
    pub rounds: usize,
    pub games_per_round: usize,
    pub swap_colors: bool,
    pub reverse: bool,
    pub gauntlet_seeds: usize,
    pub concurrency: usize,
    pub use_affinity: bool,
    pub affinity_cpus: Vec<usize>,
    pub openings: OpeningOptions,
    pub adjudication: AdjudicationSettings,
    pub sprt: Option<SprtOptions>,
    /// Seeds opening shuffling; the core never reads a wall clock for this.
    pub seed: u64,
    pub wait_between_rounds: Duration,
    /// Restart crashed engines instead of aborting the tournament.
    pub recover: bool,
    pub report_penta: bool,
    /// Print a rating report every this many finished games.
    pub rating_interval: usize,
    /// And at least every this often while games are running.
    pub score_interval: Duration,
    /// Checkpoint the running counts every this many games; 0 disables.
    pub autosave_interval: usize,
    pub event: String,
    pub site: Option<String>,
    pub pgn: Option<PgnOptions>,
    pub epd: Option<EpdOptions>,
}

impl Default for TournamentOptions {
    fn default() -> Self {
        TournamentOptions {
            engines: vec![],
            format: TournamentFormat::default(),
            variant: Variant::default(),
            rounds: 2,
            games_per_round: 2,
            swap_colors: true,
            reverse: false,
            gauntlet_seeds: 1,
            concurrency: 1,
            use_affinity: false,
            affinity_cpus: vec![],
            openings: OpeningOptions::default(),
            adjudication: AdjudicationSettings::default(),
            sprt: None,
            seed: 951_356_066,
            wait_between_rounds: Duration::ZERO,
            recover: false,
            report_penta: true,
            rating_interval: 10,
            score_interval: Duration::from_secs(30),
            autosave_interval: 0,
            event: "arbiters tournament".to_string(),
            site: None,
            pgn: None,
            epd: None,
        }
    }
}

impl TournamentOptions {
    pub fn engine_index(&self, name: &str) -> Option<usize> {
        self.engines.iter().position(|e| e.name == name)
    }
}
