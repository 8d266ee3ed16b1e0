use std::fmt::Display;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::available_parallelism;
use std::time::Duration;

use anyhow::{anyhow, bail};
use colored::Colorize;
use itertools::Itertools;
use log::LevelFilter;
use num::PrimInt;

use crate::common::{parse_bool_from_str, parse_duration_secs, parse_fp_from_str, parse_int_from_str, Res};
use crate::engine::{EngineConfig, RestartMode};
use crate::play::adjudication::{DrawAdjudication, ResignAdjudication, TbAdjudication};
use crate::play::limit::{ClassicalTc, Limit};
use crate::play::openings::{BookFormat, BookOrder, OpeningOptions, OpeningPool};
use crate::tournament::stats::{Sprt, SprtModel, SprtOptions};
use crate::tournament::{EpdOptions, PgnOptions, TournamentOptions, Variant};

/// Since argument parsing libraries don't handle long arguments with a single
/// `-`, but cutechess and its descendants use that format, the parser is
/// written by hand.
pub type ArgIter<I> = std::iter::Peekable<I>;

#[derive(Debug, Clone)]
#[must_use]
pub struct LogOptions {
    pub file: PathBuf,
    pub level: LevelFilter,
    /// Include the engine line traffic in the log.
    pub engine_output: bool,
}

/// Everything the command line described: the tournament itself plus the
/// logging sink the binary sets up before running it.
#[derive(Debug)]
#[must_use]
pub struct ParsedCli {
    pub options: TournamentOptions,
    pub log: Option<LogOptions>,
}

/// Per-engine key=value block, accumulated before validation. `-each`
/// contributes defaults for every field the engine block leaves unset.
#[derive(Debug, Default, Clone)]
struct EngineCliArgs {
    name: Option<String>,
    cmd: Option<String>,
    dir: Option<PathBuf>,
    args: Vec<String>,
    init_string: Option<String>,
    stderr: Option<PathBuf>,
    tc: Option<ClassicalTc>,
    st: Option<Duration>,
    timemargin: Option<Duration>,
    nodes: Option<u64>,
    depth: Option<u32>,
    restart: Option<RestartMode>,
    options: Vec<(String, String)>,
}

pub fn parse_cli() -> Res<ParsedCli> {
    let mut args = std::env::args();
    let _name = args.next().expect("The program name is missing?!");
    parse_cli_from(args)
}

pub fn parse_cli_from<I: Iterator<Item = String>>(args: I) -> Res<ParsedCli> {
    let mut args = args.peekable();
    let mut options = TournamentOptions::default();
    let mut engines: Vec<EngineCliArgs> = vec![];
    let mut each = EngineCliArgs::default();
    let mut log = None;
    let mut force_concurrency = false;
    let mut repeat = false;
    let mut games_given = None;

    while let Some(mut arg) = args.next() {
        // cutechess expects top-level arguments to start with a single '-',
        // but also supporting the much more common '--long' syntax is
        // probably a good idea
        if arg.starts_with("--") {
            arg.remove(0);
        }
        match arg.as_str() {
            "-h" | "-help" => print_help_message(),
            "-v" | "-version" => print_version(),
            "-engine" => engines.push(parse_engine(&mut args)?),
            "-each" => each = parse_engine(&mut args)?,
            "-concurrency" => options.concurrency = next_nonzero(&mut args, "concurrency")?.get(),
            "-force-concurrency" => force_concurrency = true,
            "-rounds" => options.rounds = next_nonzero(&mut args, "rounds")?.get(),
            "-games" => games_given = Some(next_int::<usize, _>(&mut args, "games")?),
            "-repeat" => repeat = true,
            "-noswap" => options.swap_colors = false,
            "-reverse" => options.reverse = true,
            "-tournament" => {
                let value = next_arg(&mut args, "tournament")?;
                options.format = parse_enum(&value, "tournament type")?;
            }
            "-seeds" => options.gauntlet_seeds = next_nonzero(&mut args, "seeds")?.get(),
            "-srand" => options.seed = next_int(&mut args, "srand")?,
            "-wait" => {
                options.wait_between_rounds =
                    Duration::from_millis(next_int(&mut args, "wait")?)
            }
            "-variant" => {
                let value = next_arg(&mut args, "variant")?;
                options.variant = parse_enum(&value, "variant")?;
            }
            "-openings" => options.openings = parse_openings(&mut args)?,
            "-draw" => options.adjudication.draw = Some(parse_draw(&mut args)?),
            "-resign" => options.adjudication.resign = Some(parse_resign(&mut args)?),
            "-maxmoves" => {
                options.adjudication.max_moves = Some(next_nonzero(&mut args, "maxmoves")?.get() as u32)
            }
            "-tb" => {
                let paths = next_arg(&mut args, "tb")?;
                let tb = options.adjudication.tablebase.get_or_insert_with(TbAdjudication::default);
                tb.paths.extend(paths.split(':').map(PathBuf::from));
            }
            "-tbpieces" => {
                let pieces = next_nonzero(&mut args, "tbpieces")?.get() as u32;
                options
                    .adjudication
                    .tablebase
                    .get_or_insert_with(TbAdjudication::default)
                    .max_pieces = pieces;
            }
            "-tbadjudicate" => {
                let value = next_arg(&mut args, "tbadjudicate")?;
                options
                    .adjudication
                    .tablebase
                    .get_or_insert_with(TbAdjudication::default)
                    .result_type = parse_enum(&value, "tablebase adjudication mode")?;
            }
            "-tbignore50" => {
                options
                    .adjudication
                    .tablebase
                    .get_or_insert_with(TbAdjudication::default)
                    .ignore_fifty = true;
            }
            "-sprt" => options.sprt = Some(parse_sprt(&mut args)?),
            "-report" => parse_report(&mut args, &mut options)?,
            "-ratinginterval" => options.rating_interval = next_int(&mut args, "ratinginterval")?,
            "-scoreinterval" => {
                options.score_interval =
                    Duration::from_secs(next_int(&mut args, "scoreinterval")?)
            }
            "-autosaveinterval" => {
                options.autosave_interval = next_int(&mut args, "autosaveinterval")?
            }
            "-recover" => options.recover = true,
            "-event" => options.event = next_arg(&mut args, "event")?,
            "-site" => options.site = Some(next_arg(&mut args, "site")?),
            "-pgnout" => options.pgn = Some(parse_pgnout(&mut args)?),
            "-epdout" | "-fenout" => options.epd = Some(parse_epdout(&mut args)?),
            "-use-affinity" => {
                options.use_affinity = true;
                if let Some(list) = args.peek() {
                    if !list.starts_with('-') {
                        let list = args.next().unwrap();
                        options.affinity_cpus = crate::tournament::affinity::parse_cpu_list(&list)?;
                    }
                }
            }
            "-log" => log = Some(parse_log(&mut args)?),
            x => {
                bail!(
                    "Unrecognized option '{}'. Type --help for a list of all valid options",
                    x.red()
                )
            }
        }
    }

    if repeat {
        // -repeat is the colour-swap shorthand for -games 2
        games_given = Some(2);
    }
    if let Some(games) = games_given {
        if games == 0 || games > 2 {
            bail!("'-games' must be 1 or 2, not {games}")
        }
        options.games_per_round = games;
    }

    for engine in &mut engines {
        combine_engine_args(engine, &each);
    }
    options.engines = engines.into_iter().map(build_engine).collect::<Res<Vec<_>>>()?;
    validate(&mut options, force_concurrency)?;
    Ok(ParsedCli { options, log })
}

fn validate(options: &mut TournamentOptions, force_concurrency: bool) -> Res<()> {
    if options.engines.len() < 2 {
        bail!("Need at least two engines to start!")
    }
    for pair in options.engines.iter().combinations(2) {
        if pair[0].name.eq_ignore_ascii_case(&pair[1].name) {
            bail!("Engines with the same name are not allowed: '{}'", pair[0].name.red())
        }
    }
    let cpus = available_parallelism().map(|n| n.get()).unwrap_or(1);
    if options.concurrency > cpus && !force_concurrency {
        bail!("Concurrency exceeds the number of CPUs. Use -force-concurrency to override.")
    }
    if options.variant == Variant::FischerRandom && options.openings.file.is_none() {
        bail!("Please specify a Chess960 opening book")
    }
    if let Some(sprt) = options.sprt {
        Sprt::new(sprt)?;
        if options.engines.len() != 2 {
            bail!("An SPRT needs exactly two engines")
        }
    }
    if let Some(tb) = &options.adjudication.tablebase {
        if tb.paths.is_empty() {
            bail!("Tablebase adjudication needs '-tb <directory>'")
        }
        for path in &tb.paths {
            if !path.is_dir() {
                bail!("The tablebase path '{}' is not a directory", path.display().to_string().red())
            }
        }
    }
    if options.use_affinity {
        // fails when the CPU list cannot cover the concurrency
        crate::tournament::affinity::AffinityPool::new(
            options.affinity_cpus.clone(),
            options.concurrency,
        )?;
    }
    // surface book problems before any engine is started
    OpeningPool::load(&options.openings, options.variant.castling_mode(), options.seed)?;
    Ok(())
}

fn build_engine(args: EngineCliArgs) -> Res<Arc<EngineConfig>> {
    let Some(name) = args.name else {
        bail!("Please specify a name for each engine!")
    };
    let Some(cmd) = args.cmd else {
        bail!("Please specify a command for engine '{}'", name.red())
    };
    let limit = Limit {
        tc: args.tc,
        fixed_time: args.st,
        nodes: args.nodes,
        depth: args.depth,
        timemargin: args.timemargin.unwrap_or(Duration::ZERO),
    };
    limit
        .validate()
        .map_err(|err| anyhow!("engine '{}': {err}", name.bold()))?;
    for (a, b) in args.options.iter().tuple_combinations() {
        if a.0 == b.0 {
            bail!("engine '{}' sets the option '{}' twice", name.bold(), a.0.red())
        }
    }
    Ok(Arc::new(EngineConfig {
        name,
        cmd,
        dir: args.dir,
        args: args.args,
        init_string: args.init_string,
        stderr_file: args.stderr,
        limit,
        restart: args.restart.unwrap_or_default(),
        options: args.options,
    }))
}

/// Fills every unset field of an engine block from the `-each` defaults.
fn combine_engine_args(engine: &mut EngineCliArgs, each: &EngineCliArgs) {
    engine.name = engine.name.take().or_else(|| each.name.clone());
    engine.cmd = engine.cmd.take().or_else(|| each.cmd.clone());
    engine.dir = engine.dir.take().or_else(|| each.dir.clone());
    if engine.args.is_empty() {
        engine.args = each.args.clone();
    }
    engine.init_string = engine.init_string.take().or_else(|| each.init_string.clone());
    engine.stderr = engine.stderr.take().or_else(|| each.stderr.clone());
    engine.tc = engine.tc.or(each.tc);
    engine.st = engine.st.or(each.st);
    engine.timemargin = engine.timemargin.or(each.timemargin);
    engine.nodes = engine.nodes.or(each.nodes);
    engine.depth = engine.depth.or(each.depth);
    engine.restart = engine.restart.or(each.restart);
    for (key, value) in &each.options {
        if !engine.options.iter().any(|(k, _)| k == key) {
            engine.options.push((key.clone(), value.clone()));
        }
    }
}

fn parse_engine<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<EngineCliArgs> {
    let mut res = EngineCliArgs::default();
    while let Some(arg) = args.peek() {
        if arg.starts_with('-') {
            break;
        }
        let arg = args.next().unwrap();
        let (key, value) = split_key_value(&arg)?;
        match key {
            "name" => res.name = Some(value.to_string()),
            "cmd" => res.cmd = Some(value.to_string()),
            "dir" => res.dir = Some(PathBuf::from(value)),
            "arg" => res.args.push(value.to_string()),
            "args" => res.args.extend(value.split_whitespace().map(str::to_string)),
            "initstr" => res.init_string = Some(value.to_string()),
            "stderr" => res.stderr = Some(PathBuf::from(value)),
            "proto" => {
                if !value.eq_ignore_ascii_case("uci") {
                    bail!("Unsupported engine protocol '{}'; only 'uci' engines can play", value.red())
                }
            }
            "tc" => res.tc = Some(ClassicalTc::from_str(value)?),
            "st" => res.st = Some(parse_duration_secs(value, "st (move time)")?),
            "timemargin" => {
                res.timemargin =
                    Some(Duration::from_millis(parse_int_from_str(value, "timemargin")?))
            }
            "nodes" => res.nodes = Some(parse_int_from_str(value, "nodes")?),
            "depth" | "plies" => res.depth = Some(parse_int_from_str(value, "depth")?),
            "restart" => {
                res.restart = Some(match value {
                    "on" => RestartMode::On,
                    "off" => RestartMode::Off,
                    other => bail!(
                        "Invalid 'restart' parameter (must be either \"on\" or \"off\"): {}",
                        other.red()
                    ),
                })
            }
            "trust" => {
                eprintln!("Warning: the 'trust' engine option is always ignored and only exists for compatibility")
            }
            x => match x.strip_prefix("option.") {
                Some(option_name) => res.options.push((option_name.to_string(), value.to_string())),
                None => bail!("Unknown engine key '{}'", x.red()),
            },
        }
    }
    Ok(res)
}

fn parse_openings<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<OpeningOptions> {
    let mut res = OpeningOptions::default();
    for_each_key_value(args, "openings", |key, value| {
        match key {
            "file" => res.file = Some(PathBuf::from(value)),
            "format" => res.format = parse_enum::<BookFormat>(value, "book format")?,
            "order" => res.order = parse_enum::<BookOrder>(value, "book order")?,
            "plies" => res.plies = Some(parse_int_from_str(value, "plies")?),
            "start" => {
                res.start = parse_int_from_str(value, "start")?;
                if res.start == 0 {
                    bail!("the book 'start' offset is 1-based and can't be 0")
                }
            }
            x => bail!("Unknown openings key '{}'", x.red()),
        }
        Ok(())
    })?;
    Ok(res)
}

fn parse_draw<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<DrawAdjudication> {
    let mut res = DrawAdjudication { move_number: 1, move_count: 1, score: 0 };
    for_each_key_value(args, "draw adjudication", |key, value| {
        match key {
            "movenumber" => res.move_number = parse_int_from_str(value, "movenumber")?,
            "movecount" => res.move_count = parse_int_from_str(value, "movecount")?,
            "score" => res.score = parse_int_from_str(value, "score")?,
            x => bail!("Unknown draw adjudication key '{}'", x.red()),
        }
        Ok(())
    })?;
    Ok(res)
}

fn parse_resign<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<ResignAdjudication> {
    let mut res = ResignAdjudication { move_count: 1, score: 0, twosided: false };
    for_each_key_value(args, "resign adjudication", |key, value| {
        match key {
            "movecount" => res.move_count = parse_int_from_str(value, "movecount")?,
            "score" => res.score = parse_int_from_str(value, "score")?,
            "twosided" => res.twosided = parse_bool_from_str(value, "twosided")?,
            x => bail!("Unknown resign adjudication key '{}'", x.red()),
        }
        Ok(())
    })?;
    Ok(res)
}

fn parse_sprt<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<SprtOptions> {
    let mut res = SprtOptions {
        alpha: 0.05,
        beta: 0.05,
        elo0: 0.0,
        elo1: 5.0,
        model: SprtModel::default(),
    };
    for_each_key_value(args, "sprt", |key, value| {
        match key {
            "alpha" => res.alpha = parse_fp_from_str(value, "alpha")?,
            "beta" => res.beta = parse_fp_from_str(value, "beta")?,
            "elo0" => res.elo0 = parse_fp_from_str(value, "elo0")?,
            "elo1" => res.elo1 = parse_fp_from_str(value, "elo1")?,
            "model" => {
                res.model = SprtModel::from_str(value)
                    .map_err(|_| anyhow!("SPRT: invalid SPRT model '{}'!", value.red()))?
            }
            x => bail!("Unknown sprt key '{}'", x.red()),
        }
        Ok(())
    })?;
    Ok(res)
}

fn parse_report<I: Iterator<Item = String>>(
    args: &mut ArgIter<I>,
    options: &mut TournamentOptions,
) -> Res<()> {
    for_each_key_value(args, "report", |key, value| {
        match key {
            "penta" => options.report_penta = parse_bool_from_str(value, "penta")?,
            x => bail!("Unknown report key '{}'", x.red()),
        }
        Ok(())
    })
}

fn parse_pgnout<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<PgnOptions> {
    let mut file = None;
    let mut flags = PgnOptions::new(PathBuf::new());
    for_each_key_value(args, "pgnout", |key, value| {
        match key {
            "file" => file = Some(PathBuf::from(value)),
            "min" => flags.min = parse_bool_from_str(value, "min")?,
            "nodes" => flags.track_nodes = parse_bool_from_str(value, "nodes")?,
            "seldepth" => flags.track_seldepth = parse_bool_from_str(value, "seldepth")?,
            "nps" => flags.track_nps = parse_bool_from_str(value, "nps")?,
            "hashfull" => flags.track_hashfull = parse_bool_from_str(value, "hashfull")?,
            "tbhits" => flags.track_tbhits = parse_bool_from_str(value, "tbhits")?,
            "pv" => flags.track_pv = parse_bool_from_str(value, "pv")?,
            x => bail!("Unknown pgnout key '{}'", x.red()),
        }
        Ok(())
    })?;
    match file {
        Some(file) => {
            flags.file = file;
            Ok(flags)
        }
        None => bail!("'-pgnout' needs a 'file=' value"),
    }
}

fn parse_epdout<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<EpdOptions> {
    let mut file = None;
    for_each_key_value(args, "epdout", |key, value| {
        match key {
            "file" => file = Some(PathBuf::from(value)),
            x => bail!("Unknown epdout key '{}'", x.red()),
        }
        Ok(())
    })?;
    file.map(|file| EpdOptions { file })
        .ok_or_else(|| anyhow!("'-epdout' needs a 'file=' value"))
}

fn parse_log<I: Iterator<Item = String>>(args: &mut ArgIter<I>) -> Res<LogOptions> {
    let mut res = LogOptions {
        file: PathBuf::from("arbiters.log"),
        level: LevelFilter::Info,
        engine_output: true,
    };
    for_each_key_value(args, "log", |key, value| {
        match key {
            "file" => res.file = PathBuf::from(value),
            "level" => {
                res.level = LevelFilter::from_str(value)
                    .map_err(|_| anyhow!("invalid log level '{}'", value.red()))?
            }
            "engine" => res.engine_output = parse_bool_from_str(value, "engine")?,
            "realtime" => {
                // lines are written as they are read either way
                parse_bool_from_str(value, "realtime")?;
            }
            x => bail!("Unknown log key '{}'", x.red()),
        }
        Ok(())
    })?;
    Ok(res)
}

fn for_each_key_value<I: Iterator<Item = String>>(
    args: &mut ArgIter<I>,
    option: &str,
    mut handle: impl FnMut(&str, &str) -> Res<()>,
) -> Res<()> {
    while let Some(arg) = args.peek() {
        if arg.starts_with('-') {
            break;
        }
        let arg = args.next().unwrap();
        let (key, value) = split_key_value(&arg)
            .map_err(|err| anyhow!("while reading '-{option}': {err}"))?;
        handle(key, value).map_err(|err| anyhow!("while reading '-{option}': {err}"))?;
    }
    Ok(())
}

fn split_key_value(arg: &str) -> Res<(&str, &str)> {
    arg.split_once('=')
        .ok_or_else(|| anyhow!("Expected an argument of the form 'key=value', got '{}'", arg.red()))
}

fn next_arg<I: Iterator<Item = String>>(args: &mut ArgIter<I>, name: &str) -> Res<String> {
    args.next().ok_or_else(|| anyhow!("Missing value for '-{name}'"))
}

fn next_int<T: PrimInt + FromStr + Display, I: Iterator<Item = String>>(
    args: &mut ArgIter<I>,
    name: &str,
) -> Res<T> {
    parse_int_from_str(&next_arg(args, name)?, name)
}

fn next_nonzero<I: Iterator<Item = String>>(args: &mut ArgIter<I>, name: &str) -> Res<NonZeroUsize> {
    NonZeroUsize::new(next_int(args, name)?).ok_or_else(|| anyhow!("'{name}' can't be zero"))
}

fn parse_enum<T: FromStr>(value: &str, what: &str) -> Res<T> {
    T::from_str(value).map_err(|_| anyhow!("invalid {what} '{}'", value.red()))
}

fn print_help_message() {
    println!(
        "usage: arbiters -engine cmd=ENGINE name=NAME [tc=MOVES/TIME+INC | st=SECONDS] ... \
         -engine ... [options]\n\
         Runs a tournament between UCI chess engines. The most important options:\n\
         \x20 -each KEY=VALUE ...          apply engine keys to every engine\n\
         \x20 -rounds N, -games {{1|2}}, -repeat, -noswap, -reverse\n\
         \x20 -concurrency N, -force-concurrency, -use-affinity [CPUS]\n\
         \x20 -openings file=F format={{epd|pgn}} order={{sequential|random}} plies=N start=K\n\
         \x20 -draw movenumber=K movecount=N score=CP\n\
         \x20 -resign movecount=N score=CP twosided={{true|false}}\n\
         \x20 -maxmoves N, -tb DIRS, -tbpieces N, -tbadjudicate {{WIN_LOSS|DRAW|BOTH}}, -tbignore50\n\
         \x20 -sprt alpha=A beta=B elo0=E0 elo1=E1 model={{logistic|bayesian|normalized}}\n\
         \x20 -tournament {{roundrobin|gauntlet}}, -seeds N, -srand SEED, -wait MS\n\
         \x20 -pgnout file=F [nodes=... pv=... min=...], -epdout file=F\n\
         \x20 -ratinginterval N, -scoreinterval S, -autosaveinterval N, -report penta=BOOL\n\
         \x20 -variant {{standard|fischerandom}}, -recover, -event NAME, -site NAME\n\
         \x20 -log file=F level=L engine=BOOL"
    );
    std::process::exit(0)
}

fn print_version() {
    println!("arbiters {}", option_env!("CARGO_PKG_VERSION").unwrap_or("<unknown version>"));
    std::process::exit(0)
}
