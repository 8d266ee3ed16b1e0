use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use pgn_reader::{BufferedReader, RawHeader, SanPlus, Skip, Visitor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shakmaty::fen::Fen;
use shakmaty::{CastlingMode, Chess, Position};
use strum_macros::{Display, EnumString};

use crate::common::Res;

/// A starting position plus the book plies applied before play begins.
/// The colour-swapped twin of a pair reuses the same opening.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct Opening {
    /// `None` means the standard starting position.
    pub fen: Option<String>,
    /// Book moves in UCI notation.
    pub moves: Vec<String>,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BookFormat {
    #[default]
    Epd,
    Pgn,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BookOrder {
    #[default]
    Sequential,
    Random,
}

#[derive(Debug, Clone)]
#[must_use]
pub struct OpeningOptions {
    pub file: Option<PathBuf>,
    pub format: BookFormat,
    pub order: BookOrder,
    /// Truncate each opening to this many plies.
    pub plies: Option<usize>,
    /// 1-based offset of the first opening to use.
    pub start: usize,
}

impl Default for OpeningOptions {
    fn default() -> Self {
        OpeningOptions {
            file: None,
            format: BookFormat::Epd,
            order: BookOrder::Sequential,
            plies: None,
            start: 1,
        }
    }
}

/// The loaded book. Lookup is by round number, so colour-swapped twins and
/// out-of-order completion both see a stable assignment.
#[derive(Debug)]
#[must_use]
pub struct OpeningPool {
    openings: Vec<Opening>,
    start: usize,
}

impl OpeningPool {
    pub fn load(options: &OpeningOptions, castling: CastlingMode, seed: u64) -> Res<Self> {
        let mut openings = match &options.file {
            None => vec![Opening::default()],
            Some(path) => {
                let loaded = match options.format {
                    BookFormat::Epd => load_epd(path, castling)?,
                    BookFormat::Pgn => load_pgn(path, options.plies, castling)?,
                };
                if loaded.is_empty() {
                    bail!("the opening book '{}' contains no usable openings", path.display())
                }
                loaded
            }
        };
        if options.order == BookOrder::Random {
            openings.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Ok(OpeningPool { openings, start: options.start.saturating_sub(1) })
    }

    pub fn len(&self) -> usize {
        self.openings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.openings.is_empty()
    }

    /// The opening of the given 0-based round, cycling through the book.
    pub fn for_round(&self, round: usize) -> &Opening {
        &self.openings[(self.start + round) % self.openings.len()]
    }
}

fn load_epd(path: &Path, castling: CastlingMode) -> Res<Vec<Opening>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("couldn't read the opening book '{}'", path.display()))?;
    let mut openings = vec![];
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fen = normalize_epd(line).ok_or_else(|| {
            anyhow!("line {} of '{}' is not a valid EPD record", idx + 1, path.display())
        })?;
        // round-trip through the rules library so a bad record fails at load
        // time instead of mid-tournament
        parse_fen(&fen, castling).map_err(|err| {
            anyhow!("line {} of '{}': {err}", idx + 1, path.display())
        })?;
        openings.push(Opening { fen: Some(fen), moves: vec![] });
    }
    Ok(openings)
}

/// EPD records are FENs without the move counters, optionally followed by
/// opcodes. Returns the six-field FEN, or `None` for a malformed record.
fn normalize_epd(line: &str) -> Option<String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let mut fen = fields[..4].join(" ");
    let halfmove = fields.get(4).filter(|f| f.parse::<u32>().is_ok());
    let fullmove = fields.get(5).filter(|f| f.parse::<u32>().is_ok());
    match (halfmove, fullmove) {
        (Some(h), Some(f)) => {
            fen.push(' ');
            fen.push_str(h);
            fen.push(' ');
            fen.push_str(f);
        }
        (Some(h), None) => {
            fen.push(' ');
            fen.push_str(h);
            fen.push_str(" 1");
        }
        _ => fen.push_str(" 0 1"),
    }
    Some(fen)
}

pub fn parse_fen(fen: &str, castling: CastlingMode) -> Res<Chess> {
    let parsed: Fen = Fen::from_ascii(fen.as_bytes())
        .map_err(|err| anyhow!("invalid FEN '{}': {err}", fen.red()))?;
    parsed
        .into_position(castling)
        .map_err(|err| anyhow!("illegal position '{}': {err}", fen.red()))
}

fn load_pgn(path: &Path, plies: Option<usize>, castling: CastlingMode) -> Res<Vec<Opening>> {
    let file = File::open(path)
        .with_context(|| format!("couldn't open the opening book '{}'", path.display()))?;
    let mut reader = BufferedReader::new(file);
    let mut visitor = BookVisitor::new(plies, castling);
    let mut openings = vec![];
    while let Some(game) = reader
        .read_game(&mut visitor)
        .with_context(|| format!("couldn't parse the opening book '{}'", path.display()))?
    {
        match game {
            Ok(opening) => openings.push(opening),
            Err(err) => bail!("unusable game in opening book '{}': {err}", path.display()),
        }
    }
    Ok(openings)
}

/// Collects one opening per game: the FEN header (if any) plus the mainline
/// moves, converted to UCI and truncated to the ply limit.
struct BookVisitor {
    plies: Option<usize>,
    castling: CastlingMode,
    fen: Option<String>,
    pos: Chess,
    moves: Vec<String>,
    error: Option<String>,
}

impl BookVisitor {
    fn new(plies: Option<usize>, castling: CastlingMode) -> Self {
        BookVisitor {
            plies,
            castling,
            fen: None,
            pos: Chess::default(),
            moves: vec![],
            error: None,
        }
    }
}

impl Visitor for BookVisitor {
    type Result = Result<Opening, String>;

    fn begin_game(&mut self) {
        self.fen = None;
        self.pos = Chess::default();
        self.moves.clear();
        self.error = None;
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        if key == b"FEN" {
            self.fen = Some(value.decode_utf8_lossy().into_owned());
        }
    }

    fn end_headers(&mut self) -> Skip {
        if let Some(fen) = &self.fen {
            match parse_fen(fen, self.castling) {
                Ok(pos) => self.pos = pos,
                Err(err) => self.error = Some(err.to_string()),
            }
        }
        Skip(self.error.is_some())
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn san(&mut self, san_plus: SanPlus) {
        if self.error.is_some() || self.plies.is_some_and(|max| self.moves.len() >= max) {
            return;
        }
        match san_plus.san.to_move(&self.pos) {
            Ok(mov) => {
                self.moves.push(mov.to_uci(self.castling).to_string());
                self.pos.play_unchecked(&mov);
            }
            Err(err) => self.error = Some(format!("illegal move {san_plus}: {err}")),
        }
    }

    fn end_game(&mut self) -> Self::Result {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(Opening { fen: self.fen.take(), moves: std::mem::take(&mut self.moves) }),
        }
    }
}
