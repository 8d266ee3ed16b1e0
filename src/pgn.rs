use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;

use crate::common::Res;
use crate::play::limit::Limit;
use crate::play::{Game, MoveRecord};
use crate::tournament::PgnOptions;

/// Appends finished games to a PGN file. Writers are shared across workers,
/// so all writes go through a mutex; games land in completion order.
#[derive(Debug)]
pub struct PgnWriter {
    file: Mutex<File>,
    options: PgnOptions,
    event: String,
    site: Option<String>,
}

impl PgnWriter {
    pub fn new(options: PgnOptions, event: &str, site: Option<&str>) -> Res<Self> {
        let file = open_append(&options.file)?;
        Ok(PgnWriter {
            file: Mutex::new(file),
            options,
            event: event.to_string(),
            site: site.map(str::to_string),
        })
    }

    pub fn write_game(&self, game: &Game, white_limit: &Limit, black_limit: &Limit) -> Res<()> {
        let text = self.render(game, white_limit, black_limit);
        let mut file = self.file.lock().unwrap();
        file.write_all(text.as_bytes())
            .and_then(|()| file.flush())
            .with_context(|| format!("couldn't write to '{}'", self.options.file.display()))
    }

    fn render(&self, game: &Game, white_limit: &Limit, black_limit: &Limit) -> String {
        let mut out = String::new();
        let tag = |out: &mut String, name: &str, value: &str| {
            writeln!(out, "[{name} \"{value}\"]").unwrap();
        };
        tag(&mut out, "Event", &self.event);
        if let Some(site) = &self.site {
            tag(&mut out, "Site", site);
        }
        tag(&mut out, "Date", &game.started_at.format("%Y.%m.%d").to_string());
        tag(&mut out, "Round", &format!("{}.{}", game.round + 1, game.game_in_round + 1));
        tag(&mut out, "White", &game.white);
        tag(&mut out, "Black", &game.black);
        tag(&mut out, "Result", game.result.as_pgn());
        if let Some(fen) = &game.opening_fen {
            tag(&mut out, "SetUp", "1");
            tag(&mut out, "FEN", fen);
        }
        if !self.options.min {
            tag(&mut out, "PlyCount", &game.moves.len().to_string());
            if white_limit == black_limit {
                tag(&mut out, "TimeControl", &white_limit.to_string());
            } else {
                tag(&mut out, "WhiteTimeControl", &white_limit.to_string());
                tag(&mut out, "BlackTimeControl", &black_limit.to_string());
            }
            tag(&mut out, "Termination", game.result.reason.termination_tag());
        }
        out.push('\n');

        let (mut move_number, mut white_to_move) = starting_point(game.opening_fen.as_deref());
        let mut tokens: Vec<String> = vec![];
        for record in &game.moves {
            if white_to_move {
                tokens.push(format!("{move_number}."));
            } else if tokens.is_empty() {
                tokens.push(format!("{move_number}..."));
            }
            tokens.push(record.san.clone());
            if let Some(comment) = self.comment(record) {
                tokens.push(comment);
            }
            if !white_to_move {
                move_number += 1;
            }
            white_to_move = !white_to_move;
        }
        tokens.push(game.result.as_pgn().to_string());
        out.push_str(&wrap(&tokens, 80));
        out.push('\n');
        out
    }

    /// The per-move annotation, cutechess-style `{score/depth time}` with
    /// the extras the user asked for. Minimal output has none; book plies
    /// are only marked as such.
    fn comment(&self, record: &MoveRecord) -> Option<String> {
        if self.options.min {
            return None;
        }
        if record.book {
            return Some("{book}".to_string());
        }
        let mut comment = String::from("{");
        match record.info.score {
            Some(score) => {
                write!(comment, "{}/{} ", score.as_pgn(), record.info.depth).unwrap();
            }
            None => comment.push_str("?/? "),
        }
        write!(comment, "{:.3}s", record.think.as_secs_f64()).unwrap();
        if self.options.track_nodes {
            write!(comment, " n={}", record.info.nodes).unwrap();
        }
        if self.options.track_nps {
            write!(comment, " nps={}", record.info.nps).unwrap();
        }
        if self.options.track_seldepth {
            write!(comment, " sd={}", record.info.seldepth).unwrap();
        }
        if self.options.track_hashfull {
            write!(comment, " hf={}", record.info.hashfull).unwrap();
        }
        if self.options.track_tbhits {
            write!(comment, " tb={}", record.info.tbhits).unwrap();
        }
        if self.options.track_pv && !record.info.pv.is_empty() {
            write!(comment, " pv {}", record.info.pv.join(" ")).unwrap();
        }
        comment.push('}');
        Some(comment)
    }
}

/// Writes one EPD record (the final position) per finished game.
#[derive(Debug)]
pub struct EpdWriter {
    file: Mutex<File>,
    path: std::path::PathBuf,
}

impl EpdWriter {
    pub fn new(path: &Path) -> Res<Self> {
        Ok(EpdWriter { file: Mutex::new(open_append(path)?), path: path.to_path_buf() })
    }

    pub fn write_game(&self, game: &Game) -> Res<()> {
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{}", game.final_fen)
            .and_then(|()| file.flush())
            .with_context(|| format!("couldn't write to '{}'", self.path.display()))
    }
}

fn open_append(path: &Path) -> Res<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("couldn't create '{}'", parent.display()))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("couldn't open '{}'", path.display()))
}

/// The move number and side to move the movetext starts with.
fn starting_point(fen: Option<&str>) -> (u32, bool) {
    let Some(fen) = fen else {
        return (1, true);
    };
    let fields: Vec<&str> = fen.split_whitespace().collect();
    let white_to_move = fields.get(1).map_or(true, |f| *f != "b");
    let move_number = fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(1);
    (move_number, white_to_move)
}

fn wrap(tokens: &[String], width: usize) -> String {
    let mut out = String::new();
    let mut line_len = 0;
    for token in tokens {
        if line_len == 0 {
            out.push_str(token);
            line_len = token.len();
        } else if line_len + 1 + token.len() > width {
            out.push('\n');
            out.push_str(token);
            line_len = token.len();
        } else {
            out.push(' ');
            out.push_str(token);
            line_len += 1 + token.len();
        }
    }
    out
}
