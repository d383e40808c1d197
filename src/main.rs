//! Command line front end: run voltage sweeps and inspect results files.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_runner::bus::{EventBus, Filter};
use daq_runner::config::Settings;
use daq_runner::job::{Job, JobHandle};
use daq_runner::logging;
use daq_runner::manager::{AbortOutcome, Manager};
use daq_runner::messages::{Payload, Topic};
use daq_runner::procedure::Status;
use daq_runner::procedures::SweepProcedure;
use daq_runner::results::{unique_filename, Cell, Results};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "daq_runner", version, about = "Queue and record measurement procedures")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue one or more voltage sweeps and wait for them
    Run {
        /// Parameter binding, repeatable
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Results file (single run only); defaults to a fresh name in results.directory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Number of identical jobs to queue
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },
    /// Print the header and row count of a results file
    Inspect {
        /// Results file to read
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    logging::init(&settings.logging)?;

    match cli.command {
        Commands::Run {
            params,
            output,
            repeat,
        } => run(settings, &params, output, repeat).await,
        Commands::Inspect { path } => inspect(&path),
    }
}

fn build_sweep(params: &[String]) -> Result<SweepProcedure> {
    let mut sweep = SweepProcedure::simulated()?;
    for binding in params {
        let (name, value) = binding
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{binding}'"))?;
        sweep.bind(name.trim(), value.trim())?;
    }
    Ok(sweep)
}

async fn run(
    settings: Settings,
    params: &[String],
    output: Option<PathBuf>,
    repeat: usize,
) -> Result<()> {
    if output.is_some() && repeat != 1 {
        bail!("--output names a single file; drop it to use generated names with --repeat");
    }

    let bus = EventBus::from_settings(&settings.bus).await?;
    if let Some(addr) = bus.mirror_addr() {
        info!("Mirroring events on {addr}");
    }
    let manager = Manager::spawn(settings.manager.clone(), bus.clone());

    let mut events = bus.subscribe(Filter::all().topics([Topic::Status, Topic::Log]));
    let printer = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            match message.payload {
                Payload::Status(status) => println!("[{}] {status}", message.job),
                Payload::Log(record) => {
                    println!("[{}] {:?}: {}", message.job, record.level, record.message)
                }
                _ => {}
            }
        }
    });

    let mut handles: Vec<JobHandle> = Vec::with_capacity(repeat);
    for _ in 0..repeat {
        // Bind before creating the file so a bad value leaves nothing behind.
        let sweep = build_sweep(params)?;
        let path = match &output {
            Some(path) => path.clone(),
            None => unique_filename(&settings.results.directory, &settings.results.prefix)?,
        };
        let job = Job::create(sweep, &path)
            .with_context(|| format!("cannot create results file {}", path.display()))?;
        handles.push(manager.queue(job).await?);
    }

    tokio::select! {
        () = wait_all(&mut handles) => {}
        _ = tokio::signal::ctrl_c() => {
            let dropped = manager.clear_queued().await?;
            match manager.abort().await {
                Ok(AbortOutcome::Stopped(status)) => println!("running job stopped: {status}"),
                Ok(AbortOutcome::StillRunning) => println!("running job did not stop in time"),
                Err(e) => println!("abort: {e}"),
            }
            println!("{dropped} queued job(s) dropped");
        }
    }

    manager.shutdown().await?;
    printer.abort();

    for handle in &handles {
        let path = handle
            .results_path()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string());
        println!("{} {} -> {path}", handle.id(), handle.status());
    }
    if handles.iter().any(|h| h.status() == Status::Failed) {
        bail!("one or more jobs failed");
    }
    Ok(())
}

async fn wait_all(handles: &mut [JobHandle]) {
    for handle in handles.iter_mut() {
        handle.wait().await;
    }
}

fn inspect(path: &Path) -> Result<()> {
    let loaded = Results::load(path)?;
    println!("Procedure: {}", loaded.procedure);
    println!("Parameters:");
    for (name, value) in &loaded.parameters {
        println!("  {name}: {value}");
    }
    if !loaded.metadata.is_empty() {
        println!("Metadata:");
        for (name, value) in &loaded.metadata {
            println!("  {name}: {value}");
        }
    }
    let labels: Vec<String> = loaded.columns.iter().map(|c| c.label()).collect();
    println!("Columns: {}", labels.join(", "));
    println!("Rows: {}", loaded.row_count());
    if let Some(last) = loaded.rows.last() {
        let cells: Vec<String> = last
            .iter()
            .map(|cell| match cell {
                Cell::Number(v) => v.to_string(),
                Cell::Text(t) => t.clone(),
            })
            .collect();
        println!("Last row: {}", cells.join(", "));
    }
    Ok(())
}
