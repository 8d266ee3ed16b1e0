use std::fmt::Write;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::common::{parse_int_from_str, tokens, Res};
use crate::play::limit::{Clock, Limit};
use crate::score::Score;

/// The condensed view of everything an engine reported while searching one
/// move: the values of the *last* `info` line seen before `bestmove`.
#[derive(Debug, Default, Clone)]
#[must_use]
pub struct SearchSummary {
    pub depth: u32,
    pub seldepth: u32,
    pub score: Option<Score>,
    pub nodes: u64,
    pub nps: u64,
    pub hashfull: u32,
    pub tbhits: u64,
    pub time: Duration,
    pub pv: Vec<String>,
}

const INFO_KEYS: [&str; 16] = [
    "depth", "seldepth", "time", "nodes", "nps", "hashfull", "tbhits", "score", "pv", "multipv",
    "currmove", "currmovenumber", "sbhits", "cpuload", "refutation", "currline",
];

/// Loosely parses one `info` line into `summary`. Known keys update the
/// summary, unknown tokens are skipped; the only hard errors are truncated
/// values for keys we do interpret. `info string` lines leave the summary
/// untouched and are returned for the log.
pub fn parse_info<'a>(line: &'a str, summary: &mut SearchSummary) -> Res<Option<&'a str>> {
    debug_assert!(line.starts_with("info"));
    let rest = line["info".len()..].trim_start();
    if let Some(msg) = rest.strip_prefix("string ") {
        return Ok(Some(msg));
    }
    let mut words = tokens(rest);
    while let Some(key) = words.next() {
        match key {
            "depth" => summary.depth = next_int(&mut words, "depth")?,
            "seldepth" => summary.seldepth = next_int(&mut words, "seldepth")?,
            "time" => summary.time = Duration::from_millis(next_int(&mut words, "time")?),
            "nodes" => summary.nodes = next_int(&mut words, "nodes")?,
            "nps" => summary.nps = next_int(&mut words, "nps")?,
            "hashfull" => summary.hashfull = next_int(&mut words, "hashfull")?,
            "tbhits" => summary.tbhits = next_int(&mut words, "tbhits")?,
            "score" => {
                let kind = words
                    .next()
                    .ok_or_else(|| anyhow!("info line ends after 'score', expected 'cp' or 'mate'"))?;
                match kind {
                    "cp" => summary.score = Some(Score::Cp(next_int(&mut words, "cp")?)),
                    "mate" => summary.score = Some(Score::Mate(next_int(&mut words, "mate")?)),
                    _ => bail!("unrecognized score type '{kind}'"),
                }
                // an optional bound tag may follow the value
                if words
                    .peek()
                    .is_some_and(|w| *w == "lowerbound" || *w == "upperbound")
                {
                    words.next();
                }
            }
            "pv" => {
                // the pv runs to the end of the line unless another key follows
                let mut pv = vec![];
                while let Some(word) = words.peek() {
                    if INFO_KEYS.contains(word) {
                        break;
                    }
                    pv.push(words.next().unwrap().to_string());
                }
                if !pv.is_empty() {
                    summary.pv = pv;
                }
            }
            // keys with one value we don't track
            "multipv" | "currmove" | "currmovenumber" | "sbhits" | "cpuload" => {
                words.next();
            }
            // anything else is some engine-specific extension; skip the token
            _ => {}
        }
    }
    Ok(None)
}

fn next_int<T: num::PrimInt + std::str::FromStr>(words: &mut crate::common::Tokens, name: &str) -> Res<T> {
    parse_int_from_str(
        words
            .next()
            .ok_or_else(|| anyhow!("info line ends after '{name}', expected a value"))?,
        name,
    )
}

#[derive(Debug, Clone, Eq, PartialEq)]
#[must_use]
pub struct BestMove {
    pub mov: String,
    pub ponder: Option<String>,
}

pub fn parse_bestmove(line: &str) -> Res<BestMove> {
    let mut words = tokens(line);
    let Some("bestmove") = words.next() else {
        bail!("expected a line starting with 'bestmove', got '{line}'")
    };
    let Some(mov) = words.next() else {
        bail!("missing move after 'bestmove'")
    };
    let ponder = match words.next() {
        Some("ponder") => Some(
            words
                .next()
                .ok_or_else(|| anyhow!("missing move after 'ponder'"))?
                .to_string(),
        ),
        _ => None,
    };
    Ok(BestMove { mov: mov.to_string(), ponder })
}

/// `id name ...` / `id author ...` from the handshake.
pub fn parse_id(line: &str) -> Option<(&str, String)> {
    let rest = line.strip_prefix("id ")?;
    let (key, value) = rest.split_at(rest.find(' ')?);
    Some((key, value.trim().to_string()))
}

pub fn position_command(fen: Option<&str>, moves: &[String]) -> String {
    let mut cmd = match fen {
        Some(fen) => format!("position fen {fen}"),
        None => "position startpos".to_string(),
    };
    if !moves.is_empty() {
        cmd.push_str(" moves");
        for mov in moves {
            cmd.push(' ');
            cmd.push_str(mov);
        }
    }
    cmd
}

/// Builds the go command for the side to move from its limit and the two
/// live clocks. Every present budget is passed through; an engine with no
/// budget at all searches until stopped.
pub fn go_command(
    limit: &Limit,
    white: Option<&Clock>,
    black: Option<&Clock>,
    side_to_move: shakmaty::Color,
) -> String {
    let mut res = String::from("go ");
    if let Some(clock) = white {
        write!(res, "wtime {} ", clock.remaining.as_millis()).unwrap();
        if !clock.increment.is_zero() {
            write!(res, "winc {} ", clock.increment.as_millis()).unwrap();
        }
    }
    if let Some(clock) = black {
        write!(res, "btime {} ", clock.remaining.as_millis()).unwrap();
        if !clock.increment.is_zero() {
            write!(res, "binc {} ", clock.increment.as_millis()).unwrap();
        }
    }
    let mover = match side_to_move {
        shakmaty::Color::White => white,
        shakmaty::Color::Black => black,
    };
    if let Some(left) = mover.and_then(Clock::moves_to_go) {
        write!(res, "movestogo {left} ").unwrap();
    }
    if let Some(fixed) = limit.fixed_time {
        write!(res, "movetime {} ", fixed.as_millis()).unwrap();
    }
    if let Some(nodes) = limit.nodes {
        write!(res, "nodes {nodes} ").unwrap();
    }
    if let Some(depth) = limit.depth {
        write!(res, "depth {depth} ").unwrap();
    }
    let res = res.trim_end().to_string();
    if res == "go" {
        "go infinite".to_string()
    } else {
        res
    }
}
