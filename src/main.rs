use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use memstack::{
    config::Config,
    mlp::{queue::QueueModel, MlpKind},
    pipeline::{run_benchmark, RunOptions},
    pool,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

static CANCEL: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    CANCEL.store(true, Ordering::Relaxed);
}

fn setup_signal_handler() {
    #[allow(clippy::fn_to_numeric_cast_any)]
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t)
    };
}

const USAGE: &str = "\
memstack -i <input> -o <output> (-p <config.json> | --config <json>) [options]

  -b a,b,...            benchmarks to model (default: every benchmark in <input>)
  -j N                  benchmarks modelled in parallel (default: 1)
  -m MODEL              MLP model: stride, cold or cold_stride (default: stride)
  --queuing MODEL       bus queuing model: MLP or none (default: MLP)
  --prefetch            remove misses covered by a stride prefetcher
  --boundary            boundary-corrected reuse to stack distance mapping
  -a STRUCT/param=val   override a configuration parameter (repeatable)
  --overwrite           replace an existing output directory";

struct Args {
    options: RunOptions,
    config: Config,
    benchmarks: Vec<String>,
    jobs: usize,
    overwrite: bool,
}

fn parse_args() -> Result<Args, Box<dyn Error>> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        println!("{USAGE}");
        std::process::exit(0);
    }
    let input: PathBuf = args.value_from_str("-i")?;
    let output: PathBuf = args.value_from_str("-o")?;
    let overrides: Vec<String> = args.values_from_str("-a")?;
    let config = match args.opt_value_from_str::<_, String>("--config")? {
        Some(text) => Config::from_str_with(&text, &overrides)?,
        None => {
            let path: Option<PathBuf> = args.opt_value_from_str("-p")?;
            let path = path.ok_or("must provide a config with --config <json> or -p <path>")?;
            Config::from_path(&path, &overrides)?
        }
    };
    let benchmarks = args
        .opt_value_from_str::<_, String>("-b")?
        .map(|b| b.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    let jobs = args.opt_value_from_str("-j")?.unwrap_or(1);
    let mlp = args.opt_value_from_str("-m")?.unwrap_or(MlpKind::Stride);
    let queue = args.opt_value_from_str("--queuing")?.unwrap_or(QueueModel::Mlp);
    let prefetch = args.contains("--prefetch");
    let boundary = args.contains("--boundary");
    let overwrite = args.contains("--overwrite");

    let rest = args.finish();
    if !rest.is_empty() {
        return Err(format!("unexpected arguments: {rest:?}").into());
    }
    Ok(Args {
        options: RunOptions {
            input,
            output,
            mlp,
            queue,
            prefetch,
            boundary,
        },
        config,
        benchmarks,
        jobs,
        overwrite,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Creates the output directory. An existing one is emptied with
/// `overwrite`; otherwise the start time is appended to the name.
fn prepare_output(output: &Path, overwrite: bool) -> std::io::Result<PathBuf> {
    let dir = if !output.exists() {
        output.to_path_buf()
    } else if overwrite {
        fs::remove_dir_all(output)?;
        output.to_path_buf()
    } else {
        let mut name = output.as_os_str().to_owned();
        name.push(format!("_{}", unix_now()));
        let dir = PathBuf::from(name);
        tracing::warn!("{} exists, writing to {} instead", output.display(), dir.display());
        dir
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Every benchmark directory of the input, skipping histogram caches.
fn discover_benchmarks(input: &Path) -> std::io::Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(input)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && !name.starts_with("sd_hists_") {
            found.push(name);
        }
    }
    found.sort_by_key(|n| n.to_lowercase());
    Ok(found)
}

#[derive(Serialize)]
struct ExecInfo<'a> {
    command: Vec<String>,
    started_at: u64,
    version: &'static str,
    benchmarks: &'a [String],
    options: &'a RunOptions,
}

fn run() -> Result<bool, Box<dyn Error>> {
    let mut args = parse_args()?;
    let machine = args.config.to_machine()?;
    args.options.output = prepare_output(&args.options.output, args.overwrite)?;
    if args.benchmarks.is_empty() {
        args.benchmarks = discover_benchmarks(&args.options.input)?;
    }

    let output = &args.options.output;
    args.config.save(output)?;
    let exec = ExecInfo {
        command: std::env::args().collect(),
        started_at: unix_now(),
        version: env!("CARGO_PKG_VERSION"),
        benchmarks: &args.benchmarks,
        options: &args.options,
    };
    serde_json::to_writer_pretty(fs::File::create(output.join("exec.json"))?, &exec)?;

    setup_signal_handler();
    let outcome = pool::run(&args.benchmarks, args.jobs, &CANCEL, |bench| {
        run_benchmark(&machine, &args.options, bench, &CANCEL).map(|_| ())
    });

    if outcome.cancelled {
        tracing::warn!("interrupted, removing {}", output.display());
        fs::remove_dir_all(output)?;
        return Ok(false);
    }
    tracing::info!(
        completed = outcome.completed.len(),
        failed = outcome.failed.len(),
        "results in {}",
        output.display()
    );
    Ok(outcome.failed.is_empty())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("{USAGE}");
            ExitCode::FAILURE
        }
    }
}
