use std::path::PathBuf;

use log::debug;
use shakmaty::{ByColor, Chess, Color, Position};
use shakmaty_syzygy::{Tablebase, Wdl};
use strum_macros::{Display, EnumString};

use crate::play::{AdjudicationKind, GameOutcome};
use crate::score::Score;

/// Draw adjudication: both engines keep reporting scores within the window.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct DrawAdjudication {
    /// First full move from which the rule may fire.
    pub move_number: u32,
    /// Consecutive plies *per engine* within the window.
    pub move_count: u32,
    /// Centipawn window around zero.
    pub score: i32,
}

/// Resign adjudication: one side keeps reporting a hopeless score.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct ResignAdjudication {
    pub move_count: u32,
    pub score: i32,
    /// Require the winning side's score to mirror the loser's.
    pub twosided: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, EnumString, Display)]
pub enum TbResultType {
    #[strum(serialize = "WIN_LOSS")]
    WinLoss,
    #[strum(serialize = "DRAW")]
    Draw,
    #[strum(serialize = "BOTH")]
    Both,
}

#[derive(Debug, Clone)]
#[must_use]
pub struct TbAdjudication {
    pub paths: Vec<PathBuf>,
    pub max_pieces: u32,
    pub result_type: TbResultType,
    /// Probe as if the 50-move counter were irrelevant.
    pub ignore_fifty: bool,
}

impl Default for TbAdjudication {
    fn default() -> Self {
        TbAdjudication {
            paths: vec![],
            max_pieces: 6,
            result_type: TbResultType::Both,
            ignore_fifty: false,
        }
    }
}

/// Everything configured at the CLI; shared by all games of the tournament.
#[derive(Debug, Default, Clone)]
#[must_use]
pub struct AdjudicationSettings {
    pub draw: Option<DrawAdjudication>,
    pub resign: Option<ResignAdjudication>,
    pub max_moves: Option<u32>,
    pub tablebase: Option<TbAdjudication>,
}

impl AdjudicationSettings {
    pub fn any_enabled(&self) -> bool {
        self.draw.is_some() || self.resign.is_some() || self.max_moves.is_some() || self.tablebase.is_some()
    }
}

/// Per-game adjudication state. The rules draws (mate, stalemate, 50 moves,
/// repetition, insufficient material) are the board's business and are
/// checked by the game runner before this runs; the order here is max moves,
/// tablebase, draw by score, resign, first match wins.
pub struct Adjudicator<'a> {
    settings: &'a AdjudicationSettings,
    tables: Option<&'a Tablebase<Chess>>,
    draw_streak: u32,
    resign_streak: ByColor<u32>,
}

fn side<T>(of: &ByColor<T>, color: Color) -> &T {
    match color {
        Color::White => &of.white,
        Color::Black => &of.black,
    }
}

fn side_mut<T>(of: &mut ByColor<T>, color: Color) -> &mut T {
    match color {
        Color::White => &mut of.white,
        Color::Black => &mut of.black,
    }
}

impl<'a> Adjudicator<'a> {
    pub fn new(settings: &'a AdjudicationSettings, tables: Option<&'a Tablebase<Chess>>) -> Self {
        Adjudicator {
            settings,
            tables,
            draw_streak: 0,
            resign_streak: ByColor { white: 0, black: 0 },
        }
    }

    /// Called after every applied move with the position it produced and the
    /// latest score either engine has reported. Returns the adjudicated
    /// outcome, or `None` to play on.
    pub fn check(
        &mut self,
        pos: &Chess,
        scores: &ByColor<Option<Score>>,
    ) -> Option<(GameOutcome, AdjudicationKind)> {
        self.update_streaks(scores);

        if let Some(max_moves) = self.settings.max_moves {
            // fullmoves is the number of the upcoming move
            if pos.fullmoves().get().saturating_sub(1) >= max_moves {
                return Some((GameOutcome::Draw, AdjudicationKind::MaxMoves));
            }
        }

        if let Some(result) = self.check_tablebase(pos) {
            return Some(result);
        }

        if let Some(draw) = &self.settings.draw {
            if pos.fullmoves().get() >= draw.move_number.max(1) && self.draw_streak >= 2 * draw.move_count {
                return Some((GameOutcome::Draw, AdjudicationKind::Draw));
            }
        }

        if let Some(resign) = &self.settings.resign {
            for color in [Color::White, Color::Black] {
                if resign.move_count > 0 && *side(&self.resign_streak, color) >= resign.move_count {
                    return Some((GameOutcome::loss_for(color), AdjudicationKind::Resign));
                }
            }
        }

        None
    }

    fn update_streaks(&mut self, scores: &ByColor<Option<Score>>) {
        if let Some(draw) = &self.settings.draw {
            let both_within = [Color::White, Color::Black]
                .iter()
                .all(|c| matches!(side(scores, *c), Some(score) if score.within(draw.score)));
            if both_within {
                self.draw_streak += 1;
            } else {
                self.draw_streak = 0;
            }
        }
        if let Some(resign) = &self.settings.resign {
            for color in [Color::White, Color::Black] {
                let losing =
                    matches!(side(scores, color), Some(score) if score.at_most_neg(resign.score));
                let mirrored = !resign.twosided
                    || matches!(side(scores, color.other()), Some(score) if score.at_least(resign.score));
                if losing && mirrored {
                    *side_mut(&mut self.resign_streak, color) += 1;
                } else {
                    *side_mut(&mut self.resign_streak, color) = 0;
                }
            }
        }
    }

    fn check_tablebase(&self, pos: &Chess) -> Option<(GameOutcome, AdjudicationKind)> {
        let tb = self.settings.tablebase.as_ref()?;
        let tables = self.tables?;
        if pos.board().occupied().count() as u32 > tb.max_pieces {
            return None;
        }
        // the position reaching the probe is the one the engines were sent,
        // so ep rights and castling state match the wire exactly
        let wdl = match tables.probe_wdl_after_zeroing(pos) {
            Ok(wdl) => wdl,
            Err(err) => {
                debug!("tablebase probe failed: {err}");
                return None;
            }
        };
        let outcome = wdl_outcome(wdl, tb.ignore_fifty, pos.turn());
        let wanted = match tb.result_type {
            TbResultType::WinLoss => outcome != GameOutcome::Draw,
            TbResultType::Draw => outcome == GameOutcome::Draw,
            TbResultType::Both => true,
        };
        wanted.then_some((outcome, AdjudicationKind::Tablebase))
    }
}

/// Maps a WDL probe (from the side to move's point of view) to a game
/// outcome. Cursed wins and blessed losses are draws under the 50-move
/// rule, unless the caller asked to ignore it.
fn wdl_outcome(wdl: Wdl, ignore_fifty: bool, to_move: Color) -> GameOutcome {
    let effective = match (wdl, ignore_fifty) {
        (Wdl::CursedWin, true) => Wdl::Win,
        (Wdl::BlessedLoss, true) => Wdl::Loss,
        (Wdl::CursedWin, false) | (Wdl::BlessedLoss, false) => Wdl::Draw,
        (wdl, _) => wdl,
    };
    match effective {
        Wdl::Win => GameOutcome::win_for(to_move),
        Wdl::Loss => GameOutcome::loss_for(to_move),
        _ => GameOutcome::Draw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(white: Option<Score>, black: Option<Score>) -> ByColor<Option<Score>> {
        ByColor { white, black }
    }

    fn settings(
        draw: Option<DrawAdjudication>,
        resign: Option<ResignAdjudication>,
        max_moves: Option<u32>,
    ) -> AdjudicationSettings {
        AdjudicationSettings { draw, resign, max_moves, tablebase: None }
    }

    fn play_plies(pos: &mut Chess, plies: usize) {
        for _ in 0..plies {
            let mov = pos.legal_moves()[0].clone();
            pos.play_unchecked(&mov);
        }
    }

    #[test]
    fn draw_adjudication_needs_both_sides_and_enough_plies() {
        let settings = settings(
            Some(DrawAdjudication { move_number: 1, move_count: 2, score: 10 }),
            None,
            None,
        );
        let mut adj = Adjudicator::new(&settings, None);
        let pos = Chess::default();
        let flat = scores(Some(Score::Cp(5)), Some(Score::Cp(-3)));
        assert!(adj.check(&pos, &flat).is_none());
        assert!(adj.check(&pos, &flat).is_none());
        assert!(adj.check(&pos, &flat).is_none());
        let result = adj.check(&pos, &flat).unwrap();
        assert_eq!(result, (GameOutcome::Draw, AdjudicationKind::Draw));
    }

    #[test]
    fn draw_streak_resets_when_the_window_breaks() {
        let settings = settings(
            Some(DrawAdjudication { move_number: 1, move_count: 1, score: 5 }),
            None,
            None,
        );
        let mut adj = Adjudicator::new(&settings, None);
        let pos = Chess::default();
        assert!(adj.check(&pos, &scores(Some(Score::Cp(0)), Some(Score::Cp(0)))).is_none());
        // one engine leaves the window, the streak starts over
        assert!(adj.check(&pos, &scores(Some(Score::Cp(80)), Some(Score::Cp(0)))).is_none());
        assert!(adj.check(&pos, &scores(Some(Score::Cp(0)), Some(Score::Cp(0)))).is_none());
        assert!(adj.check(&pos, &scores(Some(Score::Cp(0)), Some(Score::Cp(0)))).is_some());
    }

    #[test]
    fn draw_waits_for_the_configured_move_number() {
        let settings = settings(
            Some(DrawAdjudication { move_number: 3, move_count: 1, score: 5 }),
            None,
            None,
        );
        let mut adj = Adjudicator::new(&settings, None);
        let mut pos = Chess::default();
        let flat = scores(Some(Score::Cp(0)), Some(Score::Cp(0)));
        // streak builds up, but fullmove 3 hasn't been reached
        assert!(adj.check(&pos, &flat).is_none());
        assert!(adj.check(&pos, &flat).is_none());
        assert!(adj.check(&pos, &flat).is_none());
        play_plies(&mut pos, 4);
        assert!(adj.check(&pos, &flat).is_some());
    }

    #[test]
    fn one_sided_resignation() {
        let settings = settings(
            None,
            Some(ResignAdjudication { move_count: 3, score: 600, twosided: false }),
            None,
        );
        let mut adj = Adjudicator::new(&settings, None);
        let pos = Chess::default();
        let hopeless = scores(Some(Score::Cp(-700)), Some(Score::Cp(20)));
        assert!(adj.check(&pos, &hopeless).is_none());
        assert!(adj.check(&pos, &hopeless).is_none());
        let result = adj.check(&pos, &hopeless).unwrap();
        assert_eq!(result, (GameOutcome::BlackWin, AdjudicationKind::Resign));
    }

    #[test]
    fn twosided_resignation_needs_agreement() {
        let settings = settings(
            None,
            Some(ResignAdjudication { move_count: 1, score: 600, twosided: true }),
            None,
        );
        let mut adj = Adjudicator::new(&settings, None);
        let pos = Chess::default();
        // the opponent doesn't agree, no resignation
        assert!(adj.check(&pos, &scores(Some(Score::Cp(-700)), Some(Score::Cp(20)))).is_none());
        // mirrored scores, white resigns; a mate score is beyond any threshold
        let result = adj
            .check(&pos, &scores(Some(Score::Mate(-4)), Some(Score::Cp(650))))
            .unwrap();
        assert_eq!(result, (GameOutcome::BlackWin, AdjudicationKind::Resign));
    }

    #[test]
    fn missing_scores_break_every_streak() {
        let settings = settings(
            Some(DrawAdjudication { move_number: 1, move_count: 1, score: 5 }),
            Some(ResignAdjudication { move_count: 1, score: 600, twosided: false }),
            None,
        );
        let mut adj = Adjudicator::new(&settings, None);
        let pos = Chess::default();
        assert!(adj.check(&pos, &scores(None, Some(Score::Cp(0)))).is_none());
        assert!(adj.check(&pos, &scores(Some(Score::Cp(-900)), None)).is_some());
        // white's resign streak fired from its own reported score alone
    }

    #[test]
    fn wdl_outcomes_respect_the_fifty_move_rule() {
        use Color::{Black, White};
        assert_eq!(wdl_outcome(Wdl::Win, false, White), GameOutcome::WhiteWin);
        assert_eq!(wdl_outcome(Wdl::Win, false, Black), GameOutcome::BlackWin);
        assert_eq!(wdl_outcome(Wdl::Loss, false, White), GameOutcome::BlackWin);
        assert_eq!(wdl_outcome(Wdl::Draw, true, White), GameOutcome::Draw);
        // a cursed win only wins when the 50-move counter is ignored
        assert_eq!(wdl_outcome(Wdl::CursedWin, false, White), GameOutcome::Draw);
        assert_eq!(wdl_outcome(Wdl::CursedWin, true, White), GameOutcome::WhiteWin);
        assert_eq!(wdl_outcome(Wdl::BlessedLoss, false, Black), GameOutcome::Draw);
        assert_eq!(wdl_outcome(Wdl::BlessedLoss, true, Black), GameOutcome::WhiteWin);
    }

    #[test]
    fn max_moves_draws_after_enough_full_moves() {
        let settings = settings(None, None, Some(2));
        let mut adj = Adjudicator::new(&settings, None);
        let mut pos = Chess::default();
        let none = scores(None, None);
        play_plies(&mut pos, 3);
        // black's second move hasn't been played yet
        assert!(adj.check(&pos, &none).is_none());
        play_plies(&mut pos, 1);
        let result = adj.check(&pos, &none).unwrap();
        assert_eq!(result, (GameOutcome::Draw, AdjudicationKind::MaxMoves));
    }
}
