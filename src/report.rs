use colored::Colorize;

use crate::play::Game;
use crate::tournament::stats::{Sprt, StatsAggregator, StatsSnapshot};
use crate::tournament::TournamentOptions;

/// One line per finished game, cutechess-style.
pub fn announce_game(finished: u64, total: usize, game: &Game) {
    println!(
        "Finished game {finished} of {total} ({} vs {}): {} {{{}}}",
        game.white.bold(),
        game.black.bold(),
        game.result.as_pgn(),
        game.result.reason,
    );
}

/// The score table of every pair that has results, plus the SPRT status.
pub fn print_report(options: &TournamentOptions, stats: &StatsAggregator, snapshot: &StatsSnapshot) {
    for entry in &snapshot.pairs {
        let (Some(first), Some(second)) =
            (options.engines.get(entry.first), options.engines.get(entry.second))
        else {
            continue;
        };
        let cells = entry.cells;
        let games = cells.games();
        if games == 0 {
            continue;
        }
        let penta = stats.report_penta() && cells.pairs > 0;
        let estimate = cells.estimate(penta);
        println!(
            "Score of {} vs {}: {} - {} - {}  [{:.3}] {}",
            first.name.bold(),
            second.name.bold(),
            cells.wins,
            cells.losses,
            cells.draws,
            estimate.score,
            games,
        );
        if penta {
            let p = cells.penta;
            println!("Ptnml(0-2): [{}, {}, {}, {}, {}]", p[0], p[1], p[2], p[3], p[4]);
        }
        println!(
            "Elo difference: {:.1} +/- {:.1}, LOS: {:.1} %, DrawRatio: {:.1} %",
            estimate.elo,
            estimate.elo_error,
            estimate.los * 100.0,
            estimate.draw_ratio * 100.0,
        );
        if entry.first == 0 && entry.second == 1 {
            if let Some(sprt) = stats.sprt() {
                print_sprt_line(sprt, stats, snapshot);
            }
        }
    }
}

fn print_sprt_line(sprt: &Sprt, stats: &StatsAggregator, snapshot: &StatsSnapshot) {
    let cells = snapshot.cells((0, 1));
    let penta = stats.report_penta() && cells.pairs > 0;
    let llr = sprt.llr(&cells, penta);
    // how far along the test is, relative to whichever boundary it leans to
    let progress = if llr >= 0.0 { llr / sprt.upper } else { llr / sprt.lower };
    println!(
        "SPRT: llr {llr:.2} ({:.1}%), lbound {:.2}, ubound {:.2} [{}, {}]",
        progress * 100.0,
        sprt.lower,
        sprt.upper,
        sprt.options.elo0,
        sprt.options.elo1,
    );
}

pub fn print_summary(options: &TournamentOptions, stats: &StatsAggregator) {
    let snapshot = stats.snapshot();
    println!(
        "{}",
        format!(
            "Played {} games ({} interrupted).",
            snapshot.finished_games, snapshot.interrupted_games
        )
        .bold()
    );
    print_report(options, stats, &snapshot);
}
