use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use icosdp_store::config::{ConfigLoader, PreloadParams};
use icosdp_store::domain::{AggMode, DataId, TargetFormat};
use icosdp_store::error::IcosdpError;
use icosdp_store::output::{JsonOutput, OutputMode};
use icosdp_store::preload::PreloadOutcome;
use icosdp_store::progress::{ProgressSink, SilentProgress};
use icosdp_store::store::IcosdpStore;
use icosdp_store::tui::{ProgressTable, TableExit};

#[derive(Parser)]
#[command(name = "icosdp")]
#[command(about = "Preload and cache FLUXCOM-X-BASE fluxes from the ICOS Data Portal")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true, help = "Path to icosdp.json")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List the data ids offered by the store")]
    List,
    #[command(about = "Describe one data id")]
    Describe(DescribeArgs),
    #[command(about = "Download yearly objects and cache them as one cube")]
    Preload(PreloadArgs),
    #[command(about = "Inspect the local cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct DescribeArgs {
    data_id: String,
}

#[derive(Args)]
struct PreloadArgs {
    #[arg(required = true)]
    data_ids: Vec<String>,
    #[arg(long, value_enum)]
    agg_mode: AggMode,
    #[arg(
        long,
        num_args = 2,
        value_names = ["START", "END"],
        help = "ISO dates, e.g. 2002-01-01 2002-12-31"
    )]
    time_range: Option<Vec<String>>,
    #[arg(
        long,
        num_args = 4,
        allow_negative_numbers = true,
        value_names = ["WEST", "SOUTH", "EAST", "NORTH"]
    )]
    bbox: Option<Vec<f64>>,
    #[arg(long)]
    flatten_time: bool,
    #[arg(long, value_enum, default_value_t = TargetFormat::Zarr)]
    target_format: TargetFormat,
    #[arg(long, value_delimiter = ',')]
    chunks: Option<Vec<usize>>,
    #[arg(long, help = "Show per-dataset progress while preloading")]
    progress: bool,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "List cached artifacts")]
    List,
    #[command(about = "Show the metadata of one cached artifact")]
    Info { output_id: String },
    #[command(about = "Remove one cached artifact")]
    Remove { output_id: String },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<IcosdpError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IcosdpError) -> u8 {
    match error {
        IcosdpError::UnknownDataId { .. }
        | IcosdpError::NoDataFound(_)
        | IcosdpError::Configuration(_)
        | IcosdpError::CredentialsRequired
        | IcosdpError::InvalidDataType(_)
        | IcosdpError::InvalidOpenerId(_)
        | IcosdpError::InvalidBbox(_)
        | IcosdpError::InvalidTimeRange(_)
        | IcosdpError::ConfigRead(_)
        | IcosdpError::ConfigParse(_) => 2,
        IcosdpError::Transport(_) | IcosdpError::TransportStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = IcosdpStore::from_config(&config)?;

    match cli.command {
        Commands::List => run_list(&store, output_mode),
        Commands::Describe(args) => run_describe(&store, args, output_mode),
        Commands::Preload(args) => run_preload(&store, args, output_mode),
        Commands::Cache(args) => run_cache(&store, args.command, output_mode),
    }
}

/// Accepts both `NEE` and `FLUXCOM-X-BASE_NEE`.
fn full_data_id(value: &str) -> miette::Result<String> {
    Ok(value.parse::<DataId>()?.to_string())
}

fn run_list(store: &IcosdpStore, output_mode: OutputMode) -> miette::Result<()> {
    let ids = store
        .data_ids()
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>();
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_data_ids(&ids).into_diagnostic(),
        OutputMode::Interactive => {
            for id in &ids {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn run_describe(
    store: &IcosdpStore,
    args: DescribeArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let descriptor = store.describe_data(&full_data_id(&args.data_id)?, None)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_descriptor(&descriptor).into_diagnostic(),
        OutputMode::Interactive => {
            println!("{} ({})", descriptor.data_id, descriptor.data_type);
            println!("  crs:        {}", descriptor.crs);
            println!("  bbox:       {:?}", descriptor.bbox);
            println!(
                "  time range: {} .. {}",
                descriptor.time_range.0, descriptor.time_range.1
            );
            println!("  variables:  {}", descriptor.data_vars.join(", "));
            for mode in &descriptor.agg_modes {
                let status = match (&mode.locator, mode.preloadable) {
                    (None, _) => "not configured",
                    (Some(_), true) => "preload",
                    (Some(_), false) => "open directly",
                };
                println!(
                    "  {:<18} {:>5} deg  {:<22} {status}",
                    mode.agg_mode.as_str(),
                    mode.resolution,
                    mode.frequency
                );
            }
            Ok(())
        }
    }
}

fn run_preload(
    store: &IcosdpStore,
    args: PreloadArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let data_ids = args
        .data_ids
        .iter()
        .map(|id| full_data_id(id))
        .collect::<miette::Result<Vec<_>>>()?;
    let bbox = match args.bbox.as_deref() {
        Some([west, south, east, north]) => Some([*west, *south, *east, *north]),
        Some(other) => {
            return Err(IcosdpError::Configuration(format!(
                "bbox needs four values, got {}",
                other.len()
            ))
            .into());
        }
        None => None,
    };
    let time_range = match args.time_range {
        Some(mut dates) if dates.len() == 2 => {
            let end = dates.pop().unwrap_or_default();
            let start = dates.pop().unwrap_or_default();
            Some((start, end))
        }
        Some(dates) => {
            return Err(IcosdpError::Configuration(format!(
                "time range needs a start and an end date, got {dates:?}"
            ))
            .into());
        }
        None => None,
    };
    let show_table = args.progress && matches!(output_mode, OutputMode::Interactive);
    let params = PreloadParams {
        agg_mode: args.agg_mode,
        time_range,
        bbox,
        flatten_time: args.flatten_time,
        blocking: !show_table,
        silent: !args.progress,
        target_format: args.target_format,
        chunks: args.chunks,
    };
    let ids = data_ids.iter().map(String::as_str).collect::<Vec<_>>();

    let outcomes = if show_table {
        let sink: Arc<dyn ProgressSink> = Arc::new(SilentProgress);
        let mut handle = store.preload_data_with_sink(&ids, &params, sink)?;
        let mut table = ProgressTable::new(&data_ids);
        if table.run(&handle)? == TableExit::Detached {
            eprintln!("detached from the progress view; waiting for the preload to finish");
        }
        handle.close()?;
        handle.into_outcomes()
    } else {
        let mut handle = store.preload_data(&ids, &params)?;
        handle.close()?;
        handle.into_outcomes()
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_outcomes(&outcomes).into_diagnostic()?,
        OutputMode::Interactive => print_preload_summary(&outcomes),
    }
    first_failure(outcomes)
}

fn print_preload_summary(outcomes: &[PreloadOutcome]) {
    let green = "\x1b[32m";
    let red = "\x1b[31m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";
    let finished = outcomes.iter().filter(|o| o.is_success()).count();
    println!("{cyan}icosdp preload summary{reset}");
    println!("{green}finished: {finished}{reset}");
    println!("{red}failed:   {}{reset}", outcomes.len() - finished);
    for outcome in outcomes {
        match &outcome.result {
            Ok(artifact) => println!(
                "{green}  {} -> {}{reset}",
                outcome.data_id, artifact.storage_location
            ),
            Err(err) => {
                let phase = outcome
                    .failed_in
                    .map(|phase| phase.to_string())
                    .unwrap_or_else(|| "unknown phase".to_string());
                println!("{red}  {} failed in {phase}: {err}{reset}", outcome.data_id);
            }
        }
    }
}

fn first_failure(outcomes: Vec<PreloadOutcome>) -> miette::Result<()> {
    match outcomes.into_iter().find_map(|outcome| outcome.result.err()) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_cache(
    store: &IcosdpStore,
    command: CacheCommand,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let cache = store.cache();
    match command {
        CacheCommand::List => {
            let entries = cache.list_metadata()?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_cache(&entries).into_diagnostic(),
                OutputMode::Interactive => {
                    if entries.is_empty() {
                        println!("cache at {} is empty", cache.root());
                    }
                    for entry in &entries {
                        println!(
                            "{:<36} {:<18} {}",
                            entry.output_id,
                            entry.agg_mode.as_str(),
                            entry.written_at
                        );
                    }
                    Ok(())
                }
            }
        }
        CacheCommand::Info { output_id } => {
            let metadata = cache.describe(&output_id)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_cache(std::slice::from_ref(&metadata)).into_diagnostic()
                }
                OutputMode::Interactive => {
                    let cube = cache.open_data(&output_id)?;
                    println!("{} ({})", metadata.output_id, metadata.format);
                    println!("  data id:  {}", metadata.data_id);
                    println!("  agg mode: {}", metadata.agg_mode);
                    println!("  path:     {}", metadata.resolved_path);
                    for (dim, len) in cube.sizes() {
                        println!("  {dim:<10} {len}");
                    }
                    Ok(())
                }
            }
        }
        CacheCommand::Remove { output_id } => {
            if cache.remove(&output_id)? {
                println!("removed {output_id}");
            } else {
                println!("{output_id} is not cached");
            }
            Ok(())
        }
    }
}
