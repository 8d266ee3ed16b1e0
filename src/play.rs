use std::fmt::{Display, Formatter};
use std::time::Duration;

use shakmaty::{ByColor, Color};

use crate::engine::uci::SearchSummary;

pub mod adjudication;
pub mod game;
pub mod limit;
pub mod openings;

/// The rules library doesn't name its colours for display purposes.
pub fn color_name(color: Color) -> &'static str {
    match color {
        Color::White => "White",
        Color::Black => "Black",
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub enum GameOutcome {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameOutcome {
    pub fn win_for(color: Color) -> Self {
        match color {
            Color::White => GameOutcome::WhiteWin,
            Color::Black => GameOutcome::BlackWin,
        }
    }

    pub fn loss_for(color: Color) -> Self {
        Self::win_for(color.other())
    }

    pub fn winner(self) -> Option<Color> {
        match self {
            GameOutcome::WhiteWin => Some(Color::White),
            GameOutcome::BlackWin => Some(Color::Black),
            GameOutcome::Draw => None,
        }
    }

    pub fn points_for(self, color: Color) -> f64 {
        match self.winner() {
            None => 0.5,
            Some(winner) if winner == color => 1.0,
            Some(_) => 0.0,
        }
    }

    pub fn as_pgn(self) -> &'static str {
        match self {
            GameOutcome::WhiteWin => "1-0",
            GameOutcome::BlackWin => "0-1",
            GameOutcome::Draw => "1/2-1/2",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NormalReason {
    Checkmate,
    Stalemate,
    FiftyMoveRule,
    Repetition,
    InsufficientMaterial,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AdjudicationKind {
    Draw,
    Resign,
    MaxMoves,
    Tablebase,
}

/// Why a game ended. Exactly one of these is attached to every finished game
/// and it always agrees with the move log.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EndReason {
    Normal(NormalReason),
    Adjudicated(AdjudicationKind),
    TimeForfeit { by: Color },
    IllegalMove { mov: String, by: Color },
    Disconnect { by: Color },
    EngineError { by: Color, message: String },
    Interrupted,
}

impl EndReason {
    /// The value of the PGN `Termination` tag.
    pub fn termination_tag(&self) -> &'static str {
        match self {
            EndReason::Normal(_) => "normal",
            EndReason::Adjudicated(_) => "adjudication",
            EndReason::TimeForfeit { .. } => "time forfeit",
            EndReason::IllegalMove { .. } => "rules infraction",
            EndReason::Disconnect { .. } | EndReason::EngineError { .. } => "abandoned",
            EndReason::Interrupted => "unterminated",
        }
    }
}

impl Display for EndReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Normal(NormalReason::Checkmate) => write!(f, "checkmate"),
            EndReason::Normal(NormalReason::Stalemate) => write!(f, "stalemate"),
            EndReason::Normal(NormalReason::FiftyMoveRule) => write!(f, "draw by fifty move rule"),
            EndReason::Normal(NormalReason::Repetition) => write!(f, "draw by threefold repetition"),
            EndReason::Normal(NormalReason::InsufficientMaterial) => {
                write!(f, "draw by insufficient material")
            }
            EndReason::Adjudicated(AdjudicationKind::Draw) => write!(f, "draw by adjudication"),
            EndReason::Adjudicated(AdjudicationKind::Resign) => write!(f, "resignation by adjudication"),
            EndReason::Adjudicated(AdjudicationKind::MaxMoves) => write!(f, "draw by maximum game length"),
            EndReason::Adjudicated(AdjudicationKind::Tablebase) => write!(f, "tablebase adjudication"),
            EndReason::TimeForfeit { by } => write!(f, "{} loses on time", color_name(*by)),
            EndReason::IllegalMove { mov, by } => {
                write!(f, "{} made the illegal move {mov}", color_name(*by))
            }
            EndReason::Disconnect { by } => write!(f, "{} disconnected", color_name(*by)),
            EndReason::EngineError { by, message } => {
                write!(f, "{} had an engine error: {message}", color_name(*by))
            }
            EndReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// `outcome` is `None` only for interrupted games, which count in the
/// transcript but never in the statistics.
#[derive(Debug, Clone, Eq, PartialEq)]
#[must_use]
pub struct GameResult {
    pub outcome: Option<GameOutcome>,
    pub reason: EndReason,
}

impl GameResult {
    pub fn win(color: Color, reason: EndReason) -> Self {
        GameResult { outcome: Some(GameOutcome::win_for(color)), reason }
    }

    pub fn loss(color: Color, reason: EndReason) -> Self {
        GameResult { outcome: Some(GameOutcome::loss_for(color)), reason }
    }

    pub fn draw(reason: EndReason) -> Self {
        GameResult { outcome: Some(GameOutcome::Draw), reason }
    }

    pub fn interrupted() -> Self {
        GameResult { outcome: None, reason: EndReason::Interrupted }
    }

    pub fn as_pgn(&self) -> &'static str {
        match self.outcome {
            Some(outcome) => outcome.as_pgn(),
            None => "*",
        }
    }
}

impl Display for GameResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {{{}}}", self.as_pgn(), self.reason)
    }
}

/// One entry of the move log, with everything the PGN writer can annotate.
#[derive(Debug, Clone)]
pub struct MoveRecord {
    pub san: String,
    pub uci: String,
    pub think: Duration,
    /// Book plies carry no engine annotations.
    pub book: bool,
    pub info: SearchSummary,
    /// The unparsed `info` lines of this move, for engine-debugging output.
    pub raw_info: Vec<String>,
}

/// A finished (or interrupted) game, ready for the aggregator and the
/// output writers.
#[derive(Debug, Clone)]
#[must_use]
pub struct Game {
    pub round: usize,
    pub game_in_round: usize,
    pub white: String,
    pub black: String,
    /// `None` means the standard starting position.
    pub opening_fen: Option<String>,
    pub moves: Vec<MoveRecord>,
    pub result: GameResult,
    pub final_fen: String,
    /// Clock state when the game ended; engines without a clock have `None`.
    pub time_left: ByColor<Option<Duration>>,
    pub started_at: chrono::DateTime<chrono::Local>,
}

impl Game {
    pub fn player(&self, color: Color) -> &str {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn ply_count(&self) -> usize {
        self.moves.len()
    }
}
