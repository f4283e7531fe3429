//! Command line entry point: `assetpipe build` and `assetpipe watch`.

use anyhow::anyhow;
use argh::FromArgs;
use std::path::Path;

use crate::config;
use crate::fs::{FileSystem, RealFileSystem};
use crate::orchestrate::{Options, Orchestrator};
use crate::progress::ConsoleProgress;
use crate::server::{DevServer, Manifest};
use crate::signal;
use crate::stage::Mode;
use crate::stages;
use crate::trace;

/// an incremental asset pipeline
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// config file [default=assets.conf]
    #[argh(option, short = 'f', default = "String::from(\"assets.conf\")")]
    file: String,

    /// build mode, development or production [default=development]
    #[argh(option, short = 'm', default = "Mode::Development")]
    mode: Mode,

    /// parallelism [default from system]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// print the stage chain of every started file
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools, "-d list" to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Build(BuildArgs),
    Watch(WatchArgs),
}

/// build everything reachable from the entries once
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
struct BuildArgs {}

/// build, then rebuild whenever a source changes
#[derive(FromArgs)]
#[argh(subcommand, name = "watch")]
struct WatchArgs {}

/// Dev server stand-in for the command line: reports each round.
struct LogServer;

impl DevServer for LogServer {
    fn rebuild_complete(&mut self, manifest: &Manifest) {
        if manifest.is_success() {
            println!(
                "assetpipe: rebuilt {} files, watching for changes",
                manifest.rebuilt.len()
            );
        } else {
            println!(
                "assetpipe: {} failed ({}), watching for changes",
                manifest.failed.len(),
                manifest.failed.join(", ")
            );
        }
    }
}

fn run_impl(args: Args) -> anyhow::Result<i32> {
    if let Some(debug) = &args.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => anyhow::bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let parallelism = match args.jobs {
        Some(0) => anyhow::bail!("invalid -j 0"),
        Some(n) => n,
        None => usize::from(std::thread::available_parallelism()?),
    };

    let fs = RealFileSystem::new();
    let registry = stages::builtin_registry()?;
    let config = trace::scope("config::load", || {
        config::load(&fs, Path::new(&args.file), &registry)
    })?;
    let mut progress = ConsoleProgress::new(args.verbose);
    let options = Options {
        mode: args.mode,
        parallelism,
    };
    let fs: &dyn FileSystem = &fs;
    let mut orchestrator = Orchestrator::new(fs, config, options, &mut progress);

    match args.command {
        Command::Build(_) => {
            let report = trace::scope("build", || orchestrator.build())?;
            let stats = orchestrator.cache_stats();
            if report.built.is_empty() {
                println!("assetpipe: no work to do");
            } else {
                println!(
                    "assetpipe: built {} files ({} stage runs, {} cache hits)",
                    report.built.len(),
                    orchestrator.stage_executions(),
                    stats.hits
                );
            }
            Ok(0)
        }
        Command::Watch(_) => {
            signal::register_sigint();
            let mut server = LogServer;
            orchestrator.watch(&mut server, None, &signal::interrupted);
            Ok(0)
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    let res = run_impl(args);
    trace::close()?;
    res
}
