use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Neg;

/// Centipawn equivalent used to order mate scores above any evaluation an
/// engine could plausibly report. Not a valid engine score itself.
pub const SCORE_MATE: i32 = 32_000;

/// A score as reported by an engine in an `info` line, from the point of view
/// of the engine that sent it. Mate distances are kept separate from
/// centipawns because the PGN writer needs the original form back.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[must_use]
pub enum Score {
    Cp(i32),
    /// Mate in the given number of moves, negative when getting mated.
    Mate(i32),
}

impl Default for Score {
    fn default() -> Self {
        Score::Cp(0)
    }
}

impl Score {
    /// Collapses the score into a single centipawn-comparable number.
    /// Mate scores land beyond every adjudication threshold, closer mates higher.
    pub fn cp_equivalent(self) -> i32 {
        match self {
            Score::Cp(cp) => cp,
            Score::Mate(moves) if moves >= 0 => SCORE_MATE - moves,
            Score::Mate(moves) => -SCORE_MATE - moves,
        }
    }

    pub fn is_mate(self) -> bool {
        matches!(self, Score::Mate(_))
    }

    /// True if the score is at least `threshold_cp` in favour of the reporting side.
    pub fn at_least(self, threshold_cp: i32) -> bool {
        self.cp_equivalent() >= threshold_cp
    }

    /// True if the score is at least `threshold_cp` against the reporting side.
    pub fn at_most_neg(self, threshold_cp: i32) -> bool {
        self.cp_equivalent() <= -threshold_cp
    }

    /// True if the score lies within `[-threshold_cp, threshold_cp]`.
    pub fn within(self, threshold_cp: i32) -> bool {
        self.cp_equivalent().abs() <= threshold_cp
    }

    /// The compact form used in PGN move comments, pawns for normal scores
    /// and `M<n>` for mates, e.g. `+0.25` or `-M7`.
    pub fn as_pgn(self) -> String {
        match self {
            Score::Cp(cp) => format!("{:+.2}", cp as f64 / 100.0),
            Score::Mate(moves) if moves >= 0 => format!("+M{moves}"),
            Score::Mate(moves) => format!("-M{}", -moves),
        }
    }
}

impl Neg for Score {
    type Output = Score;

    fn neg(self) -> Self::Output {
        match self {
            Score::Cp(cp) => Score::Cp(-cp),
            Score::Mate(moves) => Score::Mate(-moves),
        }
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cp_equivalent().cmp(&other.cp_equivalent())
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Score::Cp(cp) => write!(f, "cp {cp}"),
            Score::Mate(moves) => write!(f, "mate {moves}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mate_scores_beat_every_cp_score() {
        assert!(Score::Mate(30) > Score::Cp(5000));
        assert!(Score::Mate(-1) < Score::Cp(-5000));
        assert!(Score::Mate(2) > Score::Mate(5));
        assert!(Score::Mate(-2) < Score::Mate(-5));
    }

    #[test]
    fn thresholds() {
        assert!(Score::Cp(600).at_least(600));
        assert!(!Score::Cp(599).at_least(600));
        assert!(Score::Mate(12).at_least(600));
        assert!(Score::Mate(-12).at_most_neg(600));
        assert!(Score::Cp(-5).within(5));
        assert!(!Score::Mate(3).within(5));
    }

    #[test]
    fn pgn_form() {
        assert_eq!(Score::Cp(25).as_pgn(), "+0.25");
        assert_eq!(Score::Cp(-130).as_pgn(), "-1.30");
        assert_eq!(Score::Mate(7).as_pgn(), "+M7");
        assert_eq!(Score::Mate(-2).as_pgn(), "-M2");
        assert_eq!((-Score::Mate(3)).as_pgn(), "-M3");
    }
}
