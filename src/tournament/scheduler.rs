use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam_utils::thread;
use log::{error, info, warn};
use shakmaty::{ByColor, Chess};
use shakmaty_syzygy::Tablebase;

use crate::common::Res;
use crate::engine::session::EngineSession;
use crate::engine::{process, RestartMode};
use crate::pgn::{EpdWriter, PgnWriter};
use crate::play::game::{GameRunner, GameSpec};
use crate::play::openings::OpeningPool;
use crate::play::{EndReason, Game, GameResult};
use crate::report;
use crate::tournament::affinity::{pin_process, AffinityPool, CpuGroup};
use crate::tournament::pairing::{Pairing, PairingStream, RoundTask};
use crate::tournament::stats::{RoundRecord, Sprt, SprtVerdict, StatsAggregator};
use crate::tournament::TournamentOptions;
use crate::CancelToken;

/// How the tournament ended; the binary maps this to its exit code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TournamentStatus {
    /// All scheduled rounds were played.
    Finished,
    /// The SPRT crossed a boundary and the remaining rounds were skipped.
    SprtDecided(SprtVerdict),
    /// The operator interrupted the run.
    Interrupted,
}

/// One finished scheduling unit travelling from a worker to the main loop.
enum WorkerMessage {
    Round(RoundReport),
    /// An engine is unusable and recovery is off: the tournament has to stop.
    Fatal(String),
}

struct RoundReport {
    task: RoundTask,
    games: Vec<(Pairing, Game)>,
}

/// Runs the whole tournament: a lazy pairing producer, a bounded worker
/// pool playing one round task at a time, and this thread folding results
/// into statistics, reports and output files.
pub fn run_tournament(options: TournamentOptions, cancel: CancelToken) -> Res<TournamentStatus> {
    let openings =
        OpeningPool::load(&options.openings, options.variant.castling_mode(), options.seed)?;
    let tables = load_tablebases(&options)?;
    let sprt = options.sprt.map(Sprt::new).transpose()?;
    let penta_possible = options.games_per_round == 2 && options.swap_colors;
    let stats = StatsAggregator::new(sprt, options.report_penta && penta_possible);
    let pgn = match options.pgn.clone() {
        Some(pgn_options) => {
            Some(PgnWriter::new(pgn_options, &options.event, options.site.as_deref())?)
        }
        None => None,
    };
    let epd = match &options.epd {
        Some(epd_options) => Some(EpdWriter::new(&epd_options.file)?),
        None => None,
    };
    let affinity = if options.use_affinity {
        Some(AffinityPool::new(options.affinity_cpus.clone(), options.concurrency)?)
    } else {
        None
    };

    let total_games = PairingStream::new(&options).total_games();
    let stop_scheduling = AtomicBool::new(false);
    let (task_tx, task_rx) = bounded::<RoundTask>(options.concurrency);
    let (result_tx, result_rx) = unbounded::<WorkerMessage>();

    // everything below is shared by reference: the scope joins all threads
    // before any of it goes away
    let (verdict, fatal) = thread::scope(|s| {
        // the producer owns its sender so the task channel closes (and the
        // workers drain out) as soon as it stops scheduling
        let producer_options = &options;
        let producer_stop = &stop_scheduling;
        let producer_cancel = &cancel;
        s.builder()
            .name("pairing producer".to_string())
            .spawn(move |_| {
                for task in PairingStream::new(producer_options) {
                    if producer_stop.load(Ordering::SeqCst) || producer_cancel.is_cancelled() {
                        break;
                    }
                    if task_tx.send(task).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn the pairing producer");

        for worker_id in 0..options.concurrency {
            let ctx = WorkerContext {
                options: &options,
                openings: &openings,
                tables: tables.as_ref(),
                cancel: cancel.clone(),
                affinity: affinity.as_ref(),
                tasks: task_rx.clone(),
                results: result_tx.clone(),
            };
            s.builder()
                .name(format!("worker #{worker_id}"))
                .spawn(move |_| ctx.run())
                .expect("failed to spawn a worker thread");
        }
        // the workers hold the only senders/receivers we still need
        drop(task_rx);
        drop(result_tx);

        let mut verdict = None;
        let mut fatal = None;
        let mut finished_games: u64 = 0;
        let mut last_report = Instant::now();
        let mut games_at_last_report: u64 = 0;

        loop {
            match result_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(WorkerMessage::Round(round_report)) => {
                    for (_, game) in &round_report.games {
                        finished_games += 1;
                        report::announce_game(finished_games, total_games, game);
                        write_outputs(&options, pgn.as_ref(), epd.as_ref(), game);
                    }
                    stats.record_round(&to_record(&round_report));

                    if verdict.is_none() {
                        match stats.sprt_verdict() {
                            SprtVerdict::Continue => {}
                            decided => {
                                info!("SPRT finished: {decided}");
                                verdict = Some(decided);
                                stop_scheduling.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                    if options.rating_interval > 0
                        && finished_games / options.rating_interval as u64
                            != games_at_last_report / options.rating_interval as u64
                    {
                        report::print_report(&options, &stats, &stats.snapshot());
                        last_report = Instant::now();
                        games_at_last_report = finished_games;
                    }
                    if options.autosave_interval > 0
                        && finished_games % options.autosave_interval as u64 == 0
                    {
                        if let Err(err) = autosave(&options, &stats) {
                            warn!("autosave failed: {err}");
                        }
                    }
                }
                Ok(WorkerMessage::Fatal(message)) => {
                    error!("{message}");
                    fatal.get_or_insert(message);
                    cancel_everything(&cancel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_report.elapsed() >= options.score_interval
                        && finished_games > games_at_last_report
                    {
                        report::print_report(&options, &stats, &stats.snapshot());
                        last_report = Instant::now();
                        games_at_last_report = finished_games;
                    }
                }
                // every worker is done and gone
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        (verdict, fatal)
    })
    .expect("a tournament thread panicked");

    report::print_summary(&options, &stats);

    if let Some(message) = fatal {
        bail!(message)
    }
    Ok(if cancel.is_cancelled() {
        TournamentStatus::Interrupted
    } else if let Some(verdict) = verdict {
        TournamentStatus::SprtDecided(verdict)
    } else {
        TournamentStatus::Finished
    })
}

/// Sets the token and wakes every read blocked on an engine.
pub fn cancel_everything(cancel: &CancelToken) {
    cancel.cancel();
    process::interrupt_all();
}

fn to_record(round_report: &RoundReport) -> RoundRecord {
    RoundRecord {
        pair: round_report.task.pair,
        games: round_report
            .games
            .iter()
            .map(|(pairing, game)| {
                (pairing.white == round_report.task.pair.0, game.result.outcome)
            })
            .collect(),
    }
}

fn write_outputs(
    options: &TournamentOptions,
    pgn: Option<&PgnWriter>,
    epd: Option<&EpdWriter>,
    game: &Game,
) {
    if let Some(pgn) = pgn {
        let white = options.engine_index(&game.white).map(|i| &options.engines[i].limit);
        let black = options.engine_index(&game.black).map(|i| &options.engines[i].limit);
        let default = Default::default();
        if let Err(err) =
            pgn.write_game(game, white.unwrap_or(&default), black.unwrap_or(&default))
        {
            warn!("{err}");
        }
    }
    if let Some(epd) = epd {
        if let Err(err) = epd.write_game(game) {
            warn!("{err}");
        }
    }
}

fn autosave(options: &TournamentOptions, stats: &StatsAggregator) -> Res<()> {
    let path = format!("{}.autosave.json", options.event.replace(' ', "_"));
    let file = File::create(&path).with_context(|| format!("couldn't create '{path}'"))?;
    serde_json::to_writer_pretty(file, &stats.snapshot())
        .with_context(|| format!("couldn't serialize the checkpoint to '{path}'"))
}

fn load_tablebases(options: &TournamentOptions) -> Res<Option<Tablebase<Chess>>> {
    let Some(tb) = &options.adjudication.tablebase else {
        return Ok(None);
    };
    let mut tables = Tablebase::new();
    for path in &tb.paths {
        let added = tables
            .add_directory(path)
            .with_context(|| format!("couldn't load tablebases from '{}'", path.display()))?;
        info!("loaded {added} tablebase files from '{}'", path.display());
    }
    Ok(Some(tables))
}

/// Everything one worker thread owns or shares. Workers keep their engine
/// sessions alive across rounds; the restart policy and crashes are the
/// only reasons to re-spawn.
struct WorkerContext<'a> {
    options: &'a TournamentOptions,
    openings: &'a OpeningPool,
    tables: Option<&'a Tablebase<Chess>>,
    cancel: CancelToken,
    affinity: Option<&'a AffinityPool>,
    tasks: Receiver<RoundTask>,
    results: Sender<WorkerMessage>,
}

impl WorkerContext<'_> {
    fn run(self) {
        let mut sessions: Vec<Option<EngineSession>> = Vec::new();
        sessions.resize_with(self.options.engines.len(), || None);

        while let Ok(task) = self.tasks.recv() {
            if self.cancel.is_cancelled() {
                break;
            }
            let group = self.affinity.and_then(|pool| pool.claim());
            let report = self.play_round(&task, &mut sessions, group.as_ref());
            if let (Some(pool), Some(group)) = (self.affinity, group) {
                pool.release(group);
            }
            let report = match report {
                Ok(report) => report,
                Err(message) => {
                    _ = self.results.send(WorkerMessage::Fatal(message));
                    return;
                }
            };
            if self.results.send(WorkerMessage::Round(report)).is_err() {
                break;
            }
            if !self.options.wait_between_rounds.is_zero() {
                sleep(self.options.wait_between_rounds);
            }
        }
        // dropping the sessions quits the engines politely
    }

    /// Plays all games of one round task. `Err` carries a fatal message
    /// that ends the whole tournament (an engine that cannot be provided
    /// and recovery off).
    fn play_round(
        &self,
        task: &RoundTask,
        sessions: &mut Vec<Option<EngineSession>>,
        group: Option<&CpuGroup>,
    ) -> Result<RoundReport, String> {
        let mut games = vec![];
        for pairing in &task.games {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.provide_sessions(sessions, pairing, group) {
                Ok(()) => {}
                Err(message) if self.options.recover => {
                    error!("{message}; skipping the rest of round {}", task.round + 1);
                    break;
                }
                Err(message) => return Err(message),
            }
            let opening = self.openings.for_round(pairing.opening);
            let spec = GameSpec {
                round: pairing.round,
                game_in_round: pairing.game_in_round,
                opening,
                castling: self.options.variant.castling_mode(),
                adjudication: &self.options.adjudication,
                tables: self.tables,
                cancel: &self.cancel,
            };
            let (white, black) = pair_mut(sessions, pairing.white, pairing.black);
            let game = match GameRunner::new(spec).run(&mut *white, &mut *black) {
                Ok(game) => game,
                Err(err) => {
                    // not attributable to an engine: transcript-only
                    error!("game {}.{} failed: {err}", pairing.round + 1, pairing.game_in_round + 1);
                    interrupted_game(pairing, opening.fen.clone(), white.name(), black.name())
                }
            };

            let crash_message = matches!(
                game.result.reason,
                EndReason::Disconnect { .. } | EndReason::EngineError { .. }
            )
            .then(|| {
                format!(
                    "engine failure in round {} ({}); use -recover to keep the tournament running",
                    task.round + 1,
                    game.result.reason,
                )
            });
            games.push((*pairing, game));
            if let Some(message) = crash_message {
                if !self.options.recover {
                    let report = RoundReport { task: task.clone(), games };
                    _ = self.results.send(WorkerMessage::Round(report));
                    return Err(message);
                }
            }

            // per-engine restart policy: tear the process down after every game
            for idx in [pairing.white, pairing.black] {
                if self.options.engines[idx].restart == RestartMode::On {
                    if let Some(mut session) = sessions[idx].take() {
                        session.quit();
                    }
                }
            }
        }
        Ok(RoundReport { task: task.clone(), games })
    }

    /// Makes sure both sides have a live session, spawning or re-spawning
    /// as needed, and pins the children to the claimed CPU group.
    fn provide_sessions(
        &self,
        sessions: &mut [Option<EngineSession>],
        pairing: &Pairing,
        group: Option<&CpuGroup>,
    ) -> Result<(), String> {
        for idx in [pairing.white, pairing.black] {
            let dead = match &mut sessions[idx] {
                Some(session) => !session.alive(),
                None => true,
            };
            if dead {
                if let Some(mut session) = sessions[idx].take() {
                    session.quit();
                }
                let config = &self.options.engines[idx];
                let session = EngineSession::spawn(config.clone())
                    .and_then(|mut session| session.start().map(|()| session))
                    .map_err(|err| {
                        format!("couldn't start engine '{}': {err}", config.name)
                    })?;
                sessions[idx] = Some(session);
            }
            if let (Some(group), Some(session)) = (group, &sessions[idx]) {
                pin_process(session.pid(), group);
            }
        }
        Ok(())
    }
}

/// Two distinct mutable sessions out of the worker's slot table.
fn pair_mut(
    sessions: &mut [Option<EngineSession>],
    a: usize,
    b: usize,
) -> (&mut EngineSession, &mut EngineSession) {
    assert_ne!(a, b, "an engine cannot play against itself");
    if a < b {
        let (lo, hi) = sessions.split_at_mut(b);
        (lo[a].as_mut().unwrap(), hi[0].as_mut().unwrap())
    } else {
        let (lo, hi) = sessions.split_at_mut(a);
        (hi[0].as_mut().unwrap(), lo[b].as_mut().unwrap())
    }
}

fn interrupted_game(
    pairing: &Pairing,
    opening_fen: Option<String>,
    white: &str,
    black: &str,
) -> Game {
    Game {
        round: pairing.round,
        game_in_round: pairing.game_in_round,
        white: white.to_string(),
        black: black.to_string(),
        final_fen: opening_fen.clone().unwrap_or_else(|| {
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string()
        }),
        opening_fen,
        moves: vec![],
        result: GameResult::interrupted(),
        time_left: ByColor { white: None, black: None },
        started_at: chrono::Local::now(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::play::limit::Limit;

    /// An engine that shuffles its knights forever; every game it plays
    /// ends in a threefold repetition draw. Which move to play follows from
    /// how many moves are already in the position command.
    fn knight_shuffler(name: &str) -> Arc<EngineConfig> {
        let script = r#"moves=""
while read line; do
  case "$line" in
    position*moves*) moves=${line#*moves };;
    position*) moves="";;
    ucinewgame) moves="";;
    uci*) echo "uciok";;
    isready) echo "readyok";;
    go*)
      n=0
      for w in $moves; do n=$((n+1)); done
      case $((n % 4)) in
        0) m=g1f3;;
        1) m=g8f6;;
        2) m=f3g1;;
        3) m=f6g8;;
      esac
      echo "info depth 1 score cp 7 pv $m"
      echo "bestmove $m"
      ;;
    quit) exit 0;;
  esac
done"#;
        let mut config = EngineConfig::new(name, "sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config.limit = Limit { fixed_time: Some(Duration::from_secs(2)), ..Limit::default() };
        Arc::new(config)
    }

    fn small_tournament(rounds: usize, concurrency: usize) -> TournamentOptions {
        let mut options = TournamentOptions::default();
        options.engines = vec![knight_shuffler("alpha"), knight_shuffler("beta")];
        options.rounds = rounds;
        options.games_per_round = 2;
        options.concurrency = concurrency;
        options.rating_interval = 0;
        options
    }

    #[test]
    fn a_sequential_tournament_plays_every_scheduled_game() {
        let options = small_tournament(2, 1);
        let status = run_tournament(options, CancelToken::new()).unwrap();
        assert_eq!(status, TournamentStatus::Finished);
    }

    #[test]
    fn concurrent_workers_survive_a_whole_event() {
        let options = small_tournament(3, 2);
        let status = run_tournament(options, CancelToken::new()).unwrap();
        assert_eq!(status, TournamentStatus::Finished);
    }

    #[test]
    fn pre_cancelled_tournaments_report_interrupted() {
        let options = small_tournament(4, 2);
        let cancel = CancelToken::new();
        cancel.cancel();
        let status = run_tournament(options, cancel).unwrap();
        assert_eq!(status, TournamentStatus::Interrupted);
    }

    #[test]
    fn pair_mut_splits_disjoint_slots() {
        let mut slots: Vec<Option<EngineSession>> = vec![];
        slots.resize_with(3, || None);
        // only the panics matter here; empty slots would unwrap
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pair_mut(&mut slots, 1, 1);
        }));
        assert!(result.is_err(), "same-index pairing must be rejected");
    }
}
