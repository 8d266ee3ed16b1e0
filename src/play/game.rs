use std::time::Duration;

use anyhow::anyhow;
use log::info;
use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{ByColor, CastlingMode, Chess, Color, EnPassantMode, Position};
use shakmaty_syzygy::Tablebase;

use crate::common::Res;
use crate::engine::session::{EngineSession, MoveResponse};
use crate::engine::uci::{go_command, position_command, SearchSummary};
use crate::engine::EngineError;
use crate::play::adjudication::{AdjudicationSettings, Adjudicator};
use crate::play::limit::Clock;
use crate::play::openings::{parse_fen, Opening};
use crate::play::{
    color_name, EndReason, Game, GameResult, MoveRecord, NormalReason,
};
use crate::score::Score;
use crate::CancelToken;

/// Readiness probes around a game use a shorter deadline than the handshake;
/// clearing hash between games is quick compared to engine startup.
const NEW_GAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything one game needs besides its two sessions. Shared state
/// (adjudication settings, tablebases, the cancellation token) is borrowed
/// from the scheduler.
pub struct GameSpec<'a> {
    pub round: usize,
    pub game_in_round: usize,
    pub opening: &'a Opening,
    pub castling: CastlingMode,
    pub adjudication: &'a AdjudicationSettings,
    pub tables: Option<&'a Tablebase<Chess>>,
    pub cancel: &'a CancelToken,
}

/// Plays exactly one game to completion, driving both sessions through the
/// strict position/go/bestmove cycle and categorising the terminal reason.
/// Failures during the game terminate only this game.
pub struct GameRunner<'a> {
    spec: GameSpec<'a>,
    adjudicator: Adjudicator<'a>,
    board: Chess,
    history: Vec<Zobrist64>,
    moves: Vec<MoveRecord>,
    uci_moves: Vec<String>,
    scores: ByColor<Option<Score>>,
    clocks: ByColor<Option<Clock>>,
}

impl<'a> GameRunner<'a> {
    pub fn new(spec: GameSpec<'a>) -> Self {
        let adjudicator = Adjudicator::new(spec.adjudication, spec.tables);
        GameRunner {
            spec,
            adjudicator,
            board: Chess::default(),
            history: vec![],
            moves: vec![],
            uci_moves: vec![],
            scores: ByColor { white: None, black: None },
            clocks: ByColor { white: None, black: None },
        }
    }

    /// Runs the game. `Err` is reserved for failures that are not
    /// attributable to an engine (a broken opening record, say); the caller
    /// records those as interrupted without counting them.
    pub fn run(mut self, white: &mut EngineSession, black: &mut EngineSession) -> Res<Game> {
        let started_at = chrono::Local::now();
        self.setup_opening()?;
        self.clocks = ByColor {
            white: white.config().limit.clock(),
            black: black.config().limit.clock(),
        };

        let result = self.play(&mut *white, &mut *black);
        info!(
            "game {}.{} {} vs {}: {result}",
            self.spec.round + 1,
            self.spec.game_in_round + 1,
            white.name(),
            black.name(),
        );

        Ok(Game {
            round: self.spec.round,
            game_in_round: self.spec.game_in_round,
            white: white.name().to_string(),
            black: black.name().to_string(),
            opening_fen: self.spec.opening.fen.clone(),
            moves: self.moves,
            result,
            final_fen: Fen::from_position(self.board.clone(), EnPassantMode::Legal).to_string(),
            time_left: ByColor {
                white: self.clocks.white.map(|c| c.remaining),
                black: self.clocks.black.map(|c| c.remaining),
            },
            started_at,
        })
    }

    fn play(&mut self, white: &mut EngineSession, black: &mut EngineSession) -> GameResult {
        for (color, session) in [(Color::White, &mut *white), (Color::Black, &mut *black)] {
            if let Err(err) = session.new_game().and_then(|()| session.is_ready(NEW_GAME_TIMEOUT)) {
                return self.blame(color, err);
            }
        }

        // an opening may already be a finished position
        if let Some(result) = self.rules_result() {
            return result;
        }

        loop {
            if self.spec.cancel.is_cancelled() {
                return GameResult::interrupted();
            }
            let to_move = self.board.turn();
            let session = match to_move {
                Color::White => &mut *white,
                Color::Black => &mut *black,
            };

            let position_cmd =
                position_command(self.spec.opening.fen.as_deref(), &self.uci_moves);
            let go_cmd = go_command(
                &session.config().limit,
                self.clocks.white.as_ref(),
                self.clocks.black.as_ref(),
                to_move,
            );
            let remaining = self.clock_of(to_move).map(|c| c.remaining);
            let deadline = session.config().limit.move_deadline(remaining);

            let response = match session.go(&position_cmd, &go_cmd, deadline) {
                Ok(response) => response,
                Err(err) => return self.blame(to_move, err),
            };

            let margin = session.config().limit.timemargin;
            if session.config().limit.exceeded_fixed(response.elapsed) {
                return GameResult::loss(to_move, EndReason::TimeForfeit { by: to_move });
            }
            if let Some(clock) = self.clock_of_mut(to_move) {
                if !clock.consume(response.elapsed, margin) {
                    return GameResult::loss(to_move, EndReason::TimeForfeit { by: to_move });
                }
            }

            match self.apply_engine_move(to_move, &response) {
                Ok(()) => {}
                Err(reason) => return GameResult::loss(to_move, reason),
            }
            *self.score_of_mut(to_move) = response.info.score;

            if let Some(result) = self.rules_result() {
                return result;
            }
            if let Some((outcome, kind)) = self.adjudicator.check(&self.board, &self.scores) {
                return GameResult { outcome: Some(outcome), reason: EndReason::Adjudicated(kind) };
            }
        }
    }

    fn setup_opening(&mut self) -> Res<()> {
        self.board = match &self.spec.opening.fen {
            Some(fen) => parse_fen(fen, self.spec.castling)?,
            None => Chess::default(),
        };
        self.history.push(self.board.zobrist_hash(EnPassantMode::Legal));
        for uci_str in &self.spec.opening.moves {
            let uci: UciMove = UciMove::from_ascii(uci_str.as_bytes())
                .map_err(|err| anyhow!("invalid book move '{uci_str}': {err}"))?;
            let mov = uci
                .to_move(&self.board)
                .map_err(|err| anyhow!("illegal book move '{uci_str}': {err}"))?;
            let san = SanPlus::from_move_and_play_unchecked(&mut self.board, &mov);
            self.history.push(self.board.zobrist_hash(EnPassantMode::Legal));
            self.moves.push(MoveRecord {
                san: san.to_string(),
                uci: uci_str.clone(),
                think: Duration::ZERO,
                book: true,
                info: SearchSummary::default(),
                raw_info: vec![],
            });
            self.uci_moves.push(uci_str.clone());
        }
        Ok(())
    }

    fn apply_engine_move(&mut self, by: Color, response: &MoveResponse) -> Result<(), EndReason> {
        let illegal = |mov: &str| EndReason::IllegalMove { mov: mov.to_string(), by };
        let uci = UciMove::from_ascii(response.best_move.as_bytes())
            .map_err(|_| illegal(&response.best_move))?;
        // `to_move` checks full legality against the current board
        let mov = uci.to_move(&self.board).map_err(|_| illegal(&response.best_move))?;
        let uci_text = mov.to_uci(self.spec.castling).to_string();
        let san = SanPlus::from_move_and_play_unchecked(&mut self.board, &mov);
        self.history.push(self.board.zobrist_hash(EnPassantMode::Legal));
        self.moves.push(MoveRecord {
            san: san.to_string(),
            uci: uci_text.clone(),
            think: response.elapsed,
            book: false,
            info: response.info.clone(),
            raw_info: response.raw_info.clone(),
        });
        self.uci_moves.push(uci_text);
        Ok(())
    }

    /// Rule-book endings, reported by the rules library (plus the history
    /// the library cannot see: repetitions across the whole game).
    fn rules_result(&self) -> Option<GameResult> {
        let board = &self.board;
        if board.is_checkmate() {
            // the side to move is mated
            let winner = board.turn().other();
            return Some(GameResult::win(winner, EndReason::Normal(NormalReason::Checkmate)));
        }
        if board.is_stalemate() {
            return Some(GameResult::draw(EndReason::Normal(NormalReason::Stalemate)));
        }
        if board.is_insufficient_material() {
            return Some(GameResult::draw(EndReason::Normal(NormalReason::InsufficientMaterial)));
        }
        if board.halfmoves() >= 100 {
            return Some(GameResult::draw(EndReason::Normal(NormalReason::FiftyMoveRule)));
        }
        let current = self.history.last()?;
        if self.history.iter().filter(|h| *h == current).count() >= 3 {
            return Some(GameResult::draw(EndReason::Normal(NormalReason::Repetition)));
        }
        None
    }

    /// Maps a transport failure to the terminal reason charged to `culprit`.
    fn blame(&self, culprit: Color, err: EngineError) -> GameResult {
        match err {
            EngineError::Timeout => {
                GameResult::loss(culprit, EndReason::TimeForfeit { by: culprit })
            }
            EngineError::Interrupted => GameResult::interrupted(),
            err if err.is_disconnect() => {
                info!("{} disconnected: {err}", color_name(culprit));
                GameResult::loss(culprit, EndReason::Disconnect { by: culprit })
            }
            err => GameResult::loss(
                culprit,
                EndReason::EngineError { by: culprit, message: err.to_string() },
            ),
        }
    }

    fn clock_of(&self, color: Color) -> Option<&Clock> {
        match color {
            Color::White => self.clocks.white.as_ref(),
            Color::Black => self.clocks.black.as_ref(),
        }
    }

    fn clock_of_mut(&mut self, color: Color) -> Option<&mut Clock> {
        match color {
            Color::White => self.clocks.white.as_mut(),
            Color::Black => self.clocks.black.as_mut(),
        }
    }

    fn score_of_mut(&mut self, color: Color) -> &mut Option<Score> {
        match color {
            Color::White => &mut self.scores.white,
            Color::Black => &mut self.scores.black,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::play::adjudication::DrawAdjudication;
    use crate::play::limit::Limit;
    use crate::play::{AdjudicationKind, GameOutcome};

    /// A scripted engine that plays a fixed move list, one entry per `go`.
    fn scripted(name: &str, moves: &[&str], score: &str, pre: &str, limit: Limit) -> EngineSession {
        let list = moves.join(" ");
        let script = format!(
            r#"i=0
while read line; do
  case "$line" in
    ucinewgame) i=0;;
    uci*) echo "id name {name}"; echo "uciok";;
    isready) echo "readyok";;
    go*) i=$((i+1)); set -- {list}; eval "m=\$$i"; {pre}echo "info depth 1 {score} pv $m"; echo "bestmove $m";;
    quit) exit 0;;
  esac
done"#
        );
        let mut config = EngineConfig::new(name, "sh");
        config.args = vec!["-c".to_string(), script];
        config.limit = limit;
        let mut session = EngineSession::spawn(Arc::new(config)).unwrap();
        session.start().unwrap();
        session
    }

    fn fixed_time() -> Limit {
        Limit { fixed_time: Some(Duration::from_secs(1)), ..Limit::default() }
    }

    fn run_one(
        opening: &Opening,
        adjudication: &AdjudicationSettings,
        cancel: &CancelToken,
        white: &mut EngineSession,
        black: &mut EngineSession,
    ) -> Game {
        let spec = GameSpec {
            round: 0,
            game_in_round: 0,
            opening,
            castling: CastlingMode::Standard,
            adjudication,
            tables: None,
            cancel,
        };
        GameRunner::new(spec).run(white, black).unwrap()
    }

    #[test]
    fn scholars_mate_is_a_normal_checkmate() {
        let mut white = scripted(
            "mate-w",
            &["e2e4", "f1c4", "d1h5", "h5f7"],
            "score cp 500",
            "",
            fixed_time(),
        );
        let mut black =
            scripted("mate-b", &["e7e5", "b8c6", "g8f6"], "score cp -500", "", fixed_time());
        let game = run_one(
            &Opening::default(),
            &AdjudicationSettings::default(),
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::WhiteWin));
        assert_eq!(game.result.reason, EndReason::Normal(NormalReason::Checkmate));
        assert_eq!(game.ply_count(), 7);
        assert_eq!(game.moves.last().unwrap().san, "Qxf7#");
        // the wire text round-trips through the board unchanged
        assert_eq!(game.moves[0].uci, "e2e4");
        assert_eq!(game.moves.last().unwrap().uci, "h5f7");
        // black was never asked to answer the mating move
        assert_eq!(game.moves.iter().filter(|m| !m.book).count(), 7);
        white.quit();
        black.quit();
    }

    #[test]
    fn illegal_move_loses_and_the_session_still_quits_cleanly() {
        let mut white = scripted("cheat-w", &["e2e5"], "score cp 0", "", fixed_time());
        let mut black = scripted("cheat-b", &[], "score cp 0", "", fixed_time());
        let game = run_one(
            &Opening::default(),
            &AdjudicationSettings::default(),
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::BlackWin));
        assert_eq!(
            game.result.reason,
            EndReason::IllegalMove { mov: "e2e5".to_string(), by: Color::White }
        );
        assert_eq!(game.ply_count(), 0);
        // the offending engine is still shut down politely
        white.quit();
        assert!(!white.alive());
        black.quit();
    }

    #[test]
    fn sleeping_past_the_clock_forfeits_on_time() {
        let limit = Limit {
            tc: Some("0.1+0".parse().unwrap()),
            timemargin: Duration::from_millis(50),
            ..Limit::default()
        };
        let mut white = scripted("slow-w", &["e2e4"], "score cp 0", "sleep 0.5; ", limit);
        let mut black = scripted("slow-b", &[], "score cp 0", "", fixed_time());
        let game = run_one(
            &Opening::default(),
            &AdjudicationSettings::default(),
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::BlackWin));
        assert_eq!(game.result.reason, EndReason::TimeForfeit { by: Color::White });
        assert_eq!(game.ply_count(), 0);
        white.quit();
        black.quit();
    }

    #[test]
    fn flat_scores_adjudicate_a_draw() {
        let shuffle_w = ["g1f3", "f3g1", "g1f3", "f3g1"];
        let shuffle_b = ["g8f6", "f6g8", "g8f6", "f6g8"];
        let mut white = scripted("flat-w", &shuffle_w, "score cp 0", "", fixed_time());
        let mut black = scripted("flat-b", &shuffle_b, "score cp 0", "", fixed_time());
        let adjudication = AdjudicationSettings {
            draw: Some(DrawAdjudication { move_number: 1, move_count: 2, score: 5 }),
            ..AdjudicationSettings::default()
        };
        let game = run_one(
            &Opening::default(),
            &adjudication,
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::Draw));
        assert_eq!(game.result.reason, EndReason::Adjudicated(AdjudicationKind::Draw));
        // one ply for the first unilateral score, then four plies of agreement
        assert_eq!(game.ply_count(), 5);
        white.quit();
        black.quit();
    }

    #[test]
    fn knight_shuffle_ends_in_threefold_repetition() {
        let shuffle_w = ["g1f3", "f3g1", "g1f3", "f3g1"];
        let shuffle_b = ["g8f6", "f6g8", "g8f6", "f6g8"];
        let mut white = scripted("rep-w", &shuffle_w, "score cp 10", "", fixed_time());
        let mut black = scripted("rep-b", &shuffle_b, "score cp -10", "", fixed_time());
        let game = run_one(
            &Opening::default(),
            &AdjudicationSettings::default(),
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::Draw));
        assert_eq!(game.result.reason, EndReason::Normal(NormalReason::Repetition));
        assert_eq!(game.ply_count(), 8);
        white.quit();
        black.quit();
    }

    #[test]
    fn book_plies_are_recorded_before_play_begins() {
        let opening = Opening {
            fen: None,
            moves: vec!["e2e4".to_string(), "e7e5".to_string()],
        };
        let mut white =
            scripted("book-w", &["f1c4", "d1h5", "h5f7"], "score cp 300", "", fixed_time());
        let mut black = scripted("book-b", &["b8c6", "g8f6"], "score cp -300", "", fixed_time());
        let game = run_one(
            &opening,
            &AdjudicationSettings::default(),
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::WhiteWin));
        assert_eq!(game.ply_count(), 7);
        assert!(game.moves[0].book && game.moves[1].book);
        assert_eq!(game.moves[0].san, "e4");
        assert!(!game.moves[2].book);
        white.quit();
        black.quit();
    }

    #[test]
    fn a_cancelled_game_reports_interrupted() {
        let mut white = scripted("int-w", &["e2e4"], "score cp 0", "", fixed_time());
        let mut black = scripted("int-b", &[], "score cp 0", "", fixed_time());
        let cancel = CancelToken::new();
        cancel.cancel();
        let game = run_one(
            &Opening::default(),
            &AdjudicationSettings::default(),
            &cancel,
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, None);
        assert_eq!(game.result.reason, EndReason::Interrupted);
        white.quit();
        black.quit();
    }

    #[test]
    fn a_bestmove_without_a_move_is_an_engine_error() {
        let script = r#"while read line; do
  case "$line" in
    ucinewgame) ;;
    uci*) echo "uciok";;
    isready) echo "readyok";;
    go*) echo "bestmove";;
    quit) exit 0;;
  esac
done"#;
        let mut config = EngineConfig::new("broken", "sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config.limit = fixed_time();
        let mut white = EngineSession::spawn(Arc::new(config)).unwrap();
        white.start().unwrap();
        let mut black = scripted("ok-b", &[], "score cp 0", "", fixed_time());
        let game = run_one(
            &Opening::default(),
            &AdjudicationSettings::default(),
            &CancelToken::new(),
            &mut white,
            &mut black,
        );
        assert_eq!(game.result.outcome, Some(GameOutcome::BlackWin));
        assert!(matches!(game.result.reason, EndReason::EngineError { by: Color::White, .. }));
        white.quit();
        black.quit();
    }
}

