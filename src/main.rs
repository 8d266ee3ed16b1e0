use std::fs::File;
use std::process::exit;

use lib::cli::{self, LogOptions};
use lib::engine::process;
use lib::tournament::scheduler::{self, TournamentStatus};
use lib::CancelToken;
use simplelog::{Config, ConfigBuilder, WriteLogger};

/// Exit codes: 0 for a completed tournament (including an SPRT stop),
/// 1 for configuration errors, 2 for fatal runtime errors and interrupts.
fn main() {
    let parsed = match cli::parse_cli() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("{err:#}");
            exit(1);
        }
    };
    if let Some(log) = &parsed.log {
        if let Err(err) = init_logging(log) {
            eprintln!("{err:#}");
            exit(1);
        }
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            eprintln!("Interrupt received, finishing up...");
            scheduler::cancel_everything(&cancel);
        }) {
            eprintln!("Couldn't install the interrupt handler: {err}");
            exit(2);
        }
    }

    let status = scheduler::run_tournament(parsed.options, cancel);
    // whatever happened, no engine outlives the tournament
    process::kill_remaining();
    match status {
        Ok(TournamentStatus::Finished) | Ok(TournamentStatus::SprtDecided(_)) => exit(0),
        Ok(TournamentStatus::Interrupted) => exit(2),
        Err(err) => {
            eprintln!("{err:#}");
            exit(2);
        }
    }
}

fn init_logging(options: &LogOptions) -> lib::common::Res<()> {
    let config: Config = if options.engine_output {
        Config::default()
    } else {
        // engine line traffic is logged by the process layer; filtering the
        // module out keeps the log to the tournament's own events
        ConfigBuilder::new()
            .add_filter_ignore_str("lib::engine::process")
            .build()
    };
    let file = File::create(&options.file).map_err(|err| {
        anyhow::anyhow!("couldn't create the log file '{}': {err}", options.file.display())
    })?;
    WriteLogger::init(options.level, config, file)
        .map_err(|err| anyhow::anyhow!("couldn't initialize logging: {err}"))
}
